//! Dependency graph over backlog items
//!
//! Layers items into execution waves with Kahn's algorithm, detects cycles,
//! and reports which items can never become ready.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use crate::models::{BlockedItem, WorkItem};

/// Dependency graph for item ordering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyGraph {
    /// Priority of every known item
    priorities: BTreeMap<String, u32>,
    /// Maps item ID to the items it is blocked by (unknown ids included)
    depends_on: BTreeMap<String, BTreeSet<String>>,
    /// Maps item ID to the known items it blocks
    blocks: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Construct edges from each item's `blocked_by` set
    pub fn build(items: &[WorkItem]) -> Self {
        let mut graph = Self::default();

        for item in items {
            graph.priorities.insert(item.id.clone(), item.priority);
            graph.depends_on.entry(item.id.clone()).or_default();
        }

        for item in items {
            for blocker in &item.blocked_by {
                graph.add_dependency(&item.id, blocker);
            }
        }

        graph
    }

    /// `item_id` is blocked by `blocker_id`
    fn add_dependency(&mut self, item_id: &str, blocker_id: &str) {
        self.depends_on
            .entry(item_id.to_string())
            .or_default()
            .insert(blocker_id.to_string());

        self.blocks
            .entry(blocker_id.to_string())
            .or_default()
            .insert(item_id.to_string());
    }

    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.priorities.contains_key(id)
    }

    pub fn priority(&self, id: &str) -> Option<u32> {
        self.priorities.get(id).copied()
    }

    /// Blockers of an item, including ids that are not in the backlog
    pub fn blockers(&self, id: &str) -> impl Iterator<Item = &String> {
        self.depends_on.get(id).into_iter().flatten()
    }

    /// Known items directly blocked by `id`
    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &String> {
        self.blocks.get(id).into_iter().flatten()
    }

    /// Blockers that are part of the backlog
    fn known_blockers<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a String> + 'a {
        let deps = self.depends_on.get(id);
        deps.into_iter()
            .flatten()
            .filter(move |dep| self.priorities.contains_key(dep.as_str()))
    }

    /// Sort ids by (priority, id)
    pub fn sort_by_priority(&self, ids: &mut [String]) {
        ids.sort_by(|a, b| {
            let pa = self.priority(a).unwrap_or(u32::MAX);
            let pb = self.priority(b).unwrap_or(u32::MAX);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });
    }

    /// Items not yet completed whose every blocker is in `completed`.
    /// Callers drop failed or in-flight ids themselves.
    pub fn get_ready_items(&self, completed: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<String> = self
            .priorities
            .keys()
            .filter(|id| !completed.contains(*id))
            .filter(|id| self.blockers(id).all(|dep| completed.contains(dep)))
            .cloned()
            .collect();
        self.sort_by_priority(&mut ready);
        ready
    }

    /// Topological layering: wave i holds the items whose blockers all sit in
    /// waves 0..i. Blockers outside the backlog are treated as already
    /// resolved. Cycle members and everything downstream of them are left out.
    pub fn get_execution_waves(&self) -> Vec<Vec<String>> {
        self.layer(|_| true).0
    }

    /// Kahn's algorithm, level by level. `external_done` decides whether a
    /// blocker that is not in the backlog counts as resolved.
    fn layer<F>(&self, external_done: F) -> (Vec<Vec<String>>, BTreeSet<String>)
    where
        F: Fn(&str) -> bool,
    {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut stuck: BTreeSet<&str> = BTreeSet::new();

        for id in self.priorities.keys() {
            let unresolved_external = self
                .blockers(id)
                .filter(|dep| !self.contains(dep))
                .any(|dep| !external_done(dep));
            if unresolved_external {
                stuck.insert(id.as_str());
            }
            in_degree.insert(id.as_str(), self.known_blockers(id).count());
        }

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(id, degree)| **degree == 0 && !stuck.contains(*id))
            .map(|(id, _)| *id)
            .collect();

        let mut waves = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();

        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                placed.insert(id);
                for dependent in self.dependents(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 && !stuck.contains(dependent.as_str()) {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }

            let mut wave: Vec<String> = current.iter().map(|s| s.to_string()).collect();
            self.sort_by_priority(&mut wave);
            waves.push(wave);

            next.sort_unstable();
            next.dedup();
            current = next;
        }

        let leftover = self
            .priorities
            .keys()
            .filter(|id| !placed.contains(id.as_str()))
            .cloned()
            .collect();

        (waves, leftover)
    }

    /// Coloring DFS (white/gray/black); stops at the first back edge.
    /// Iterative, O(V+E), never enumerates cycles.
    pub fn has_cycles(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<&str, Color> = self
            .priorities
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();

        for root in self.priorities.keys() {
            if color[root.as_str()] != Color::White {
                continue;
            }

            let mut stack: Vec<(&str, Vec<&str>)> =
                vec![(root.as_str(), self.known_blockers(root).map(String::as_str).collect())];
            color.insert(root.as_str(), Color::Gray);

            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match color[next] {
                        Color::Gray => return true,
                        Color::White => {
                            color.insert(next, Color::Gray);
                            let children = self.known_blockers(next).map(String::as_str).collect();
                            stack.push((next, children));
                        }
                        Color::Black => {}
                    },
                    None => {
                        color.insert(*node, Color::Black);
                        stack.pop();
                    }
                }
            }
        }

        false
    }

    /// Full DFS reporting every cycle reached through a back edge, as ordered
    /// id lists rotated to start at their smallest id. Iterative like
    /// `has_cycles`; `path` doubles as the explicit stack.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_path: HashSet<&str> = HashSet::new();
        let mut cycles: BTreeSet<Vec<String>> = BTreeSet::new();

        for root in self.priorities.keys() {
            if visited.contains(root.as_str()) {
                continue;
            }

            // (node, its blockers, next blocker to look at)
            let mut path: Vec<(&str, Vec<&str>, usize)> = Vec::new();
            visited.insert(root.as_str());
            in_path.insert(root.as_str());
            let blockers = self.known_blockers(root).map(String::as_str).collect();
            path.push((root.as_str(), blockers, 0));

            while let Some((node, blockers, next)) = path.last_mut() {
                let Some(&dep) = blockers.get(*next) else {
                    in_path.remove(*node);
                    path.pop();
                    continue;
                };
                *next += 1;

                if in_path.contains(dep) {
                    if let Some(start) = path.iter().position(|(n, _, _)| *n == dep) {
                        let members: Vec<&str> = path[start..].iter().map(|(n, _, _)| *n).collect();
                        cycles.insert(canonical_cycle(&members));
                    }
                } else if visited.insert(dep) {
                    in_path.insert(dep);
                    let children = self.known_blockers(dep).map(String::as_str).collect();
                    path.push((dep, children, 0));
                }
            }
        }

        cycles.into_iter().collect()
    }

    /// True when `id` can reach itself through blocker edges
    pub fn in_cycle(&self, id: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self.known_blockers(id).map(String::as_str).collect();

        while let Some(current) = queue.pop_front() {
            if current == id {
                return true;
            }
            if seen.insert(current) {
                queue.extend(self.known_blockers(current).map(String::as_str));
            }
        }

        false
    }

    /// Items that can never become ready: members of cycles, items waiting
    /// on ids that are neither in the backlog nor in `completed`, and
    /// everything downstream of those.
    pub fn permanently_blocked(&self, completed: &HashSet<String>) -> Vec<BlockedItem> {
        let (_, leftover) = self.layer(|dep| completed.contains(dep));
        leftover
            .into_iter()
            .filter(|id| !completed.contains(id))
            .map(|id| self.blocked_item(&id, completed))
            .collect()
    }

    /// Describe why `id` is not runnable given `completed`
    pub fn blocked_item(&self, id: &str, completed: &HashSet<String>) -> BlockedItem {
        BlockedItem {
            id: id.to_string(),
            unmet: self
                .blockers(id)
                .filter(|dep| !completed.contains(*dep))
                .cloned()
                .collect(),
            in_cycle: self.in_cycle(id),
        }
    }
}

fn canonical_cycle(cycle: &[&str]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..]
        .iter()
        .chain(cycle[..start].iter())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn item(id: &str, deps: &[&str]) -> WorkItem {
        WorkItem::new(id).blocked_by(deps.iter().copied())
    }

    fn completed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_waves_for_diamond() {
        let graph = DependencyGraph::build(&[
            item("A", &[]),
            item("B", &["A"]),
            item("C", &["A"]),
            item("D", &["B", "C"]),
        ]);

        assert_eq!(
            graph.get_execution_waves(),
            vec![vec!["A"], vec!["B", "C"], vec!["D"]]
        );
        assert!(!graph.has_cycles());
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn test_waves_ordered_by_priority_then_id() {
        let graph = DependencyGraph::build(&[
            item("c", &[]).with_priority(1),
            item("b", &[]).with_priority(5),
            item("a", &[]).with_priority(5),
        ]);

        assert_eq!(graph.get_execution_waves(), vec![vec!["c", "a", "b"]]);
    }

    #[test]
    fn test_ready_items() {
        let graph = DependencyGraph::build(&[
            item("A", &[]),
            item("B", &["A"]),
            item("C", &["A", "B"]),
        ]);

        assert_eq!(graph.get_ready_items(&completed(&[])), vec!["A"]);
        assert_eq!(graph.get_ready_items(&completed(&["A"])), vec!["B"]);
        assert_eq!(graph.get_ready_items(&completed(&["A", "B"])), vec!["C"]);
        assert!(graph.get_ready_items(&completed(&["A", "B", "C"])).is_empty());
    }

    #[test]
    fn test_two_item_cycle_reported_blocked() {
        let graph = DependencyGraph::build(&[
            item("X", &["Y"]),
            item("Y", &["X"]),
            item("Z", &[]),
        ]);

        assert!(graph.has_cycles());
        assert_eq!(graph.detect_cycles(), vec![vec!["X", "Y"]]);

        // The rest of the graph proceeds
        assert_eq!(graph.get_execution_waves(), vec![vec!["Z"]]);
        assert_eq!(graph.get_ready_items(&completed(&[])), vec!["Z"]);

        let blocked = graph.permanently_blocked(&completed(&[]));
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0].id, "X");
        assert_eq!(blocked[0].unmet, vec!["Y"]);
        assert!(blocked[0].in_cycle);
        assert_eq!(blocked[1].unmet, vec!["X"]);
    }

    #[test]
    fn test_dependents_of_cycles_are_blocked_but_not_in_cycle() {
        let graph = DependencyGraph::build(&[
            item("A", &["B"]),
            item("B", &["A"]),
            item("C", &["A"]),
        ]);

        let blocked = graph.permanently_blocked(&completed(&[]));
        let c = blocked.iter().find(|b| b.id == "C").unwrap();
        assert!(!c.in_cycle);
        assert_eq!(c.unmet, vec!["A"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let graph = DependencyGraph::build(&[item("A", &["A"])]);
        assert!(graph.has_cycles());
        assert_eq!(graph.detect_cycles(), vec![vec!["A"]]);
    }

    #[test]
    fn test_detects_multiple_cycles() {
        let graph = DependencyGraph::build(&[
            item("A", &["B"]),
            item("B", &["A"]),
            item("C", &["D"]),
            item("D", &["E"]),
            item("E", &["C"]),
        ]);

        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 2);
        assert!(cycles.contains(&vec!["A".to_string(), "B".to_string()]));
        assert!(cycles.iter().any(|c| c.len() == 3 && c[0] == "C"));
    }

    #[test]
    fn test_unknown_blocker() {
        let graph = DependencyGraph::build(&[item("A", &["archived-1"]), item("B", &["A"])]);

        // Layering treats it as external
        assert_eq!(graph.get_execution_waves(), vec![vec!["A"], vec!["B"]]);

        // Readiness does not, unless it was completed earlier
        assert!(graph.get_ready_items(&completed(&[])).is_empty());
        assert_eq!(graph.get_ready_items(&completed(&["archived-1"])), vec!["A"]);

        let blocked = graph.permanently_blocked(&completed(&[]));
        assert_eq!(blocked.len(), 2);
        assert_eq!(blocked[0].unmet, vec!["archived-1"]);
        assert!(graph.permanently_blocked(&completed(&["archived-1"])).is_empty());
    }

    fn random_dag(rng: &mut StdRng, n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| {
                let mut it = WorkItem::new(format!("item-{:03}", i))
                    .with_priority(rng.gen_range(0..4));
                for j in 0..i {
                    if rng.gen_bool(0.15) {
                        it.blocked_by.insert(format!("item-{:03}", j));
                    }
                }
                it
            })
            .collect()
    }

    #[test]
    fn test_random_dags_layer_blockers_strictly_earlier() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let n = rng.gen_range(1..40);
            let items = random_dag(&mut rng, n);
            let graph = DependencyGraph::build(&items);
            let waves = graph.get_execution_waves();

            let mut wave_of: HashMap<&str, usize> = HashMap::new();
            for (i, wave) in waves.iter().enumerate() {
                for id in wave {
                    assert!(wave_of.insert(id.as_str(), i).is_none(), "{} twice", id);
                }
            }
            assert_eq!(wave_of.len(), n);

            for it in &items {
                for dep in &it.blocked_by {
                    assert!(wave_of[dep.as_str()] < wave_of[it.id.as_str()]);
                }
            }
            assert!(!graph.has_cycles());
        }
    }

    #[test]
    fn test_random_graphs_with_back_edge_have_cycles() {
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..30 {
            let n = rng.gen_range(2..30);
            let mut items = random_dag(&mut rng, n);
            // Close a chain: item-000 waits on the last item, which waits on item-000
            let last = format!("item-{:03}", n - 1);
            items[n - 1].blocked_by.insert("item-000".to_string());
            items[0].blocked_by.insert(last.clone());

            let graph = DependencyGraph::build(&items);
            assert!(graph.has_cycles());
            let cycles = graph.detect_cycles();
            assert!(cycles
                .iter()
                .any(|c| c.contains(&"item-000".to_string()) && c.contains(&last)));
        }
    }

    #[test]
    fn test_long_chain_does_not_overflow_has_cycles() {
        let items: Vec<WorkItem> = (0..5000)
            .map(|i| {
                let it = WorkItem::new(format!("n{:05}", i));
                if i == 0 {
                    it
                } else {
                    it.blocked_by([format!("n{:05}", i - 1)])
                }
            })
            .collect();
        let graph = DependencyGraph::build(&items);
        assert!(!graph.has_cycles());
        assert_eq!(graph.get_execution_waves().len(), 5000);
    }

    #[test]
    fn test_long_ring_does_not_overflow_detect_cycles() {
        let len = 50_000;
        let items: Vec<WorkItem> = (0..len)
            .map(|i| {
                WorkItem::new(format!("n{:05}", i)).blocked_by([format!("n{:05}", (i + 1) % len)])
            })
            .collect();
        let graph = DependencyGraph::build(&items);
        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), len);
        assert_eq!(cycles[0][0], "n00000");
    }
}
