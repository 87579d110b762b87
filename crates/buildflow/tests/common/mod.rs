use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    /// buildflow.yaml を書き出す
    pub fn write_config(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("buildflow.yaml");
        fs::write(&path, content).unwrap();
        path
    }

    #[allow(dead_code)]
    pub fn write_dockerfile(&self, content: &str) {
        fs::write(self.root.path().join("Dockerfile"), content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }
}
