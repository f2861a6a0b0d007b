// Utility functions

use sha2::{Digest, Sha256};
use std::sync::{Mutex, MutexGuard};

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// The guarded state may be inconsistent if the previous holder panicked.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Sanitize a string for use in a git branch name
pub fn sanitize_branch_name(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .to_lowercase()
}

/// Branch- and path-safe key for an item id.
///
/// Sanitizing alone folds ids like "US-1.1"/"US-1-1" or "Task"/"task"
/// together, so the readable part is followed by a digest of the raw id.
pub fn item_key(item_id: &str) -> String {
    let digest = Sha256::digest(item_id.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", sanitize_branch_name(item_id), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sanitize_branch_name() {
        assert_eq!(sanitize_branch_name("US-1.1"), "us-1-1");
        assert_eq!(sanitize_branch_name("my feature/story"), "my-feature-story");
        assert_eq!(sanitize_branch_name("CAPS_123"), "caps_123");
    }

    #[test]
    fn test_item_key_is_stable_and_distinct() {
        assert_eq!(item_key("US-1.1"), item_key("US-1.1"));
        assert!(item_key("US-1.1").starts_with("us-1-1-"));
        assert_eq!(item_key("US-1.1").len(), "us-1-1-".len() + 8);

        assert_ne!(item_key("US-1.1"), item_key("US-1-1"));
        assert_ne!(item_key("Task"), item_key("task"));
        assert_ne!(item_key("a/b"), item_key("a b"));
    }

    #[test]
    fn test_lock_mutex_recover_after_panic() {
        let mutex = Arc::new(Mutex::new(5));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        assert_eq!(*lock_mutex_recover(&mutex), 5);
    }
}
