// Item status state machine with validation

use super::ItemStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: ItemStatus, to: ItemStatus },

    #[error("Item already in terminal state: {0:?}")]
    AlreadyTerminal(ItemStatus),
}

/// Validates if an item can transition from one status to another
pub fn can_transition(from: ItemStatus, to: ItemStatus) -> bool {
    match (from, to) {
        // From Pending
        (ItemStatus::Pending, ItemStatus::Ready) => true,
        (ItemStatus::Pending, ItemStatus::Blocked) => true,
        (ItemStatus::Pending, ItemStatus::Failed) => true,
        (ItemStatus::Pending, ItemStatus::InProgress) => true, // Leftover work goes straight to merge

        // From Ready
        (ItemStatus::Ready, ItemStatus::InProgress) => true,
        (ItemStatus::Ready, ItemStatus::Failed) => true, // Workspace could not be created
        (ItemStatus::Ready, ItemStatus::Pending) => true,

        // From InProgress (merge pending counts as in progress)
        (ItemStatus::InProgress, ItemStatus::Completed) => true,
        (ItemStatus::InProgress, ItemStatus::Failed) => true,
        (ItemStatus::InProgress, ItemStatus::Pending) => true, // Interrupted

        // From Blocked
        (ItemStatus::Blocked, ItemStatus::Pending) => true,
        (ItemStatus::Blocked, ItemStatus::Ready) => true,

        // From Failed: sequential merge retry
        (ItemStatus::Failed, ItemStatus::InProgress) => true,

        // Same state is always allowed (no-op)
        (a, b) if a == b => true,

        _ => false,
    }
}

/// Validates and performs a state transition
pub fn transition_state(
    current: ItemStatus,
    target: ItemStatus,
) -> Result<ItemStatus, StateTransitionError> {
    if current == ItemStatus::Completed && target != ItemStatus::Completed {
        return Err(StateTransitionError::AlreadyTerminal(current));
    }
    if !can_transition(current, target) {
        return Err(StateTransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }

    Ok(target)
}

/// Check if a status is a terminal state
pub fn is_terminal_state(status: ItemStatus) -> bool {
    matches!(status, ItemStatus::Completed | ItemStatus::Failed)
}

/// Check if a status indicates active work
pub fn is_active_state(status: ItemStatus) -> bool {
    matches!(status, ItemStatus::InProgress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_to_ready_to_in_progress() {
        let s = transition_state(ItemStatus::Pending, ItemStatus::Ready).unwrap();
        let s = transition_state(s, ItemStatus::InProgress).unwrap();
        assert_eq!(s, ItemStatus::InProgress);
    }

    #[test]
    fn test_in_progress_outcomes() {
        assert!(can_transition(ItemStatus::InProgress, ItemStatus::Completed));
        assert!(can_transition(ItemStatus::InProgress, ItemStatus::Failed));
        assert!(can_transition(ItemStatus::InProgress, ItemStatus::Pending));
    }

    #[test]
    fn test_invalid_pending_to_completed() {
        assert!(!can_transition(ItemStatus::Pending, ItemStatus::Completed));
        assert!(transition_state(ItemStatus::Pending, ItemStatus::Completed).is_err());
    }

    #[test]
    fn test_completed_is_final() {
        let err = transition_state(ItemStatus::Completed, ItemStatus::Pending).unwrap_err();
        assert!(matches!(err, StateTransitionError::AlreadyTerminal(_)));
    }

    #[test]
    fn test_failed_merge_can_be_retried() {
        assert!(can_transition(ItemStatus::Failed, ItemStatus::InProgress));
        assert!(!can_transition(ItemStatus::Failed, ItemStatus::Ready));
    }

    #[test]
    fn test_same_state_allowed() {
        for status in [
            ItemStatus::Pending,
            ItemStatus::Ready,
            ItemStatus::InProgress,
            ItemStatus::Failed,
            ItemStatus::Blocked,
        ] {
            assert!(can_transition(status, status));
        }
    }

    #[test]
    fn test_is_terminal_state() {
        assert!(is_terminal_state(ItemStatus::Completed));
        assert!(is_terminal_state(ItemStatus::Failed));
        assert!(!is_terminal_state(ItemStatus::Blocked));
        assert!(!is_terminal_state(ItemStatus::InProgress));
        assert!(is_active_state(ItemStatus::InProgress));
    }
}
