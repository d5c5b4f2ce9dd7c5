use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SubagentPaths {
    root: PathBuf,
}

impl SubagentPaths {
    pub fn new(subagents_dir: impl AsRef<Path>) -> Self {
        Self {
            root: subagents_dir.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn entry_file(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{}.json", run_id))
    }

    pub fn entry_tmp_file(&self, run_id: &str) -> PathBuf {
        self.runs_dir()
            .join(format!(".{}.{}.tmp", run_id, uuid::Uuid::new_v4()))
    }
}
