//! File-contention refinement of execution waves
//!
//! Items in the same wave are dependency-independent but may still edit the
//! same files. Each wave is split into sub-waves by coloring its pairwise
//! overlap graph so that no sub-wave contains two items touching one file.

use std::collections::HashMap;

/// Waves up to this size are colored exactly (minimal number of sub-waves)
pub const EXACT_COLORING_LIMIT: usize = 12;

/// A file hint normalized for comparison. Hints ending in '/' cover a
/// whole directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Footprint {
    path: String,
    is_dir: bool,
}

fn normalize(hint: &str) -> Option<Footprint> {
    let mut path = hint.trim().replace('\\', "/");
    while let Some(stripped) = path.strip_prefix("./") {
        path = stripped.to_string();
    }
    let is_dir = path.ends_with('/');
    let path = path.trim_end_matches('/').to_string();
    if path.is_empty() {
        return None;
    }
    Some(Footprint { path, is_dir })
}

fn covers(dir: &Footprint, other: &Footprint) -> bool {
    dir.is_dir
        && other.path.len() > dir.path.len()
        && other.path.starts_with(&dir.path)
        && other.path.as_bytes()[dir.path.len()] == b'/'
}

fn overlaps(a: &Footprint, b: &Footprint) -> bool {
    a.path == b.path || covers(a, b) || covers(b, a)
}

/// True when two sets of file hints share a modified file
pub fn footprints_overlap(a: &[String], b: &[String]) -> bool {
    let a: Vec<Footprint> = a.iter().filter_map(|h| normalize(h)).collect();
    let b: Vec<Footprint> = b.iter().filter_map(|h| normalize(h)).collect();
    a.iter().any(|fa| b.iter().any(|fb| overlaps(fa, fb)))
}

/// Split every multi-item wave into contention-free sub-waves.
///
/// Items without hints never conflict. Vertices are colored in ascending id
/// order; the sub-waves keep each wave's original (priority, id) order.
pub fn refine_waves_for_contention(
    waves: &[Vec<String>],
    file_hints: &HashMap<String, Vec<String>>,
) -> Vec<Vec<String>> {
    let mut refined = Vec::new();
    for wave in waves {
        if wave.len() < 2 {
            refined.push(wave.clone());
            continue;
        }
        refined.extend(split_wave(wave, file_hints));
    }
    refined
}

/// Color one wave's overlap graph and return its sub-waves
pub fn split_wave(wave: &[String], file_hints: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut by_id: Vec<&String> = wave.iter().collect();
    by_id.sort();

    let empty = Vec::new();
    let hints: Vec<&Vec<String>> = by_id
        .iter()
        .map(|id| file_hints.get(*id).unwrap_or(&empty))
        .collect();

    let n = by_id.len();
    let mut adjacency = vec![vec![false; n]; n];
    let mut any_edge = false;
    for i in 0..n {
        for j in (i + 1)..n {
            if footprints_overlap(hints[i], hints[j]) {
                adjacency[i][j] = true;
                adjacency[j][i] = true;
                any_edge = true;
            }
        }
    }

    if !any_edge {
        return vec![wave.to_vec()];
    }

    let colors = if n <= EXACT_COLORING_LIMIT {
        exact_coloring(&adjacency)
    } else {
        greedy_coloring(&adjacency)
    };

    let color_of: HashMap<&String, usize> = by_id
        .iter()
        .zip(colors.iter())
        .map(|(id, color)| (*id, *color))
        .collect();
    let count = colors.iter().max().map(|c| c + 1).unwrap_or(0);

    let mut sub_waves: Vec<Vec<String>> = vec![Vec::new(); count];
    for id in wave {
        sub_waves[color_of[id]].push(id.clone());
    }
    sub_waves
}

/// First-fit coloring in vertex order; uses at most max degree + 1 colors
fn greedy_coloring(adjacency: &[Vec<bool>]) -> Vec<usize> {
    let n = adjacency.len();
    let mut colors: Vec<usize> = Vec::with_capacity(n);

    for v in 0..n {
        let mut used = vec![false; n + 1];
        for (u, &color) in colors.iter().enumerate() {
            if adjacency[v][u] {
                used[color] = true;
            }
        }
        let color = used.iter().position(|u| !u).unwrap_or(n);
        colors.push(color);
    }

    colors
}

/// Minimal coloring by trying k = 1, 2, ... colors with backtracking.
/// Vertices and colors are tried in ascending order, so the first solution
/// found is deterministic.
fn exact_coloring(adjacency: &[Vec<bool>]) -> Vec<usize> {
    let n = adjacency.len();
    let upper = greedy_coloring(adjacency);
    let upper_count = upper.iter().max().map(|c| c + 1).unwrap_or(0);

    for k in 1..upper_count {
        let mut colors = vec![usize::MAX; n];
        if color_with(adjacency, k, 0, 0, &mut colors) {
            return colors;
        }
    }

    upper
}

fn color_with(
    adjacency: &[Vec<bool>],
    k: usize,
    vertex: usize,
    used: usize,
    colors: &mut [usize],
) -> bool {
    if vertex == adjacency.len() {
        return true;
    }

    // A new color is interchangeable with any other unused one
    let limit = (used + 1).min(k);
    for color in 0..limit {
        let clash = (0..vertex).any(|u| adjacency[vertex][u] && colors[u] == color);
        if clash {
            continue;
        }
        colors[vertex] = color;
        if color_with(adjacency, k, vertex + 1, used.max(color + 1), colors) {
            return true;
        }
    }
    colors[vertex] = usize::MAX;
    false
}
