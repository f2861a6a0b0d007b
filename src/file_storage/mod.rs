// File-based storage helpers for run state and logs
//
// Layout under the project:
//   .ralph-ui/parallel.yaml            orchestrator config
//   .ralph-ui/parallel/run-state.json  resumable snapshot
//   .ralph-ui/parallel/run.lock        exclusive run lock
//   .ralph-ui/parallel/logs/<run>/     executor output per item

use std::fs;
use std::path::{Path, PathBuf};

pub type FileResult<T> = Result<T, String>;

/// Get the .ralph-ui directory for a project
pub fn get_ralph_ui_dir(project_path: &Path) -> PathBuf {
    project_path.join(".ralph-ui")
}

/// Get the directory holding parallel run artifacts
pub fn get_parallel_dir(project_path: &Path) -> PathBuf {
    get_ralph_ui_dir(project_path).join("parallel")
}

/// Ensure a directory exists
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read file {:?}: {}", path, e))?;

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse JSON from {:?}: {}", path, e))
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> FileResult<()> {
    let content = serde_json::to_string_pretty(data)
        .map_err(|e| format!("Failed to serialize to JSON: {}", e))?;

    atomic_write(path, &content)
}

/// Initialize .ralph-ui/parallel with a .gitignore so run artifacts never
/// show up as changes in the integration branch
pub fn init_parallel_dir(project_path: &Path) -> FileResult<PathBuf> {
    let dir = get_parallel_dir(project_path);
    ensure_dir(&dir)?;
    ensure_dir(&dir.join("logs"))?;

    let gitignore_path = dir.join(".gitignore");
    if !gitignore_path.exists() {
        fs::write(&gitignore_path, "# Runtime files (not for sharing)\n*\n")
            .map_err(|e| format!("Failed to write .gitignore: {}", e))?;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");

        atomic_write(&path, "first").unwrap();
        atomic_write(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_json_roundtrip_through_disk() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.json");

        write_json(&path, &vec!["a", "b"]).unwrap();
        let read: Vec<String> = read_json(&path).unwrap();
        assert_eq!(read, vec!["a", "b"]);
    }

    #[test]
    fn test_read_json_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let result: FileResult<Vec<String>> = read_json(&path);
        assert!(result.unwrap_err().contains("Failed to parse JSON"));
    }

    #[test]
    fn test_init_parallel_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = init_parallel_dir(temp_dir.path()).unwrap();

        assert!(dir.join("logs").is_dir());
        let ignore = fs::read_to_string(dir.join(".gitignore")).unwrap();
        assert!(ignore.contains('*'));
    }
}
