//! Per-subject data locations

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    data_dir: PathBuf,
}

impl AppPaths {
    /// `root` overrides the platform data directory.
    pub fn new(root: Option<&Path>, subject: &str) -> Result<Self, String> {
        let base = match root {
            Some(root) => root.to_owned(),
            None => Self::default_root()?,
        };
        let data_dir = base.join(subject);

        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create data directory {:?}: {}", data_dir, e))?;

        Ok(Self { data_dir })
    }

    pub fn default_root() -> Result<PathBuf, String> {
        let base = dirs::data_dir().ok_or("Could not determine data directory")?;
        Ok(base.join("operant"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn trials_file(&self) -> PathBuf {
        self.data_dir.join("trials.jsonl")
    }

    pub fn events_file(&self) -> PathBuf {
        self.data_dir.join("events.log")
    }

    pub fn summary_file(&self) -> PathBuf {
        self.data_dir.join("summary.json")
    }
}
