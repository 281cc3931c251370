use std::path::{Path, PathBuf};

use crate::error::Result;

pub const CLUSTER_FILE_NAME: &str = "cluster.conf";

/// Filesystem layout of one castle working directory.
#[derive(Debug, Clone)]
pub struct CastleEnvironment {
    working_directory: PathBuf,
}

impl CastleEnvironment {
    /// `working_directory` is made absolute against the current directory.
    pub fn new(working_directory: impl AsRef<Path>) -> Result<Self> {
        let wd = working_directory.as_ref();
        let working_directory = if wd.is_absolute() {
            wd.to_path_buf()
        } else {
            std::env::current_dir()?.join(wd)
        };
        Ok(Self { working_directory })
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Where the updated cluster file is written.
    pub fn cluster_output_path(&self) -> PathBuf {
        self.working_directory.join(CLUSTER_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.working_directory.join("logs")
    }

    /// Local copy of a node's remote log directory.
    pub fn node_logs_dir(&self, node_name: &str) -> PathBuf {
        self.logs_dir().join(node_name)
    }

    /// Command transcript for a node.
    pub fn node_log_path(&self, node_name: &str) -> PathBuf {
        self.logs_dir().join(format!("{node_name}.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_hang_off_the_working_directory() {
        let env = CastleEnvironment::new("/tmp/castle").unwrap();
        assert_eq!(
            env.cluster_output_path(),
            PathBuf::from("/tmp/castle/cluster.conf")
        );
        assert_eq!(
            env.node_log_path("node1"),
            PathBuf::from("/tmp/castle/logs/node1.log")
        );
        assert_eq!(
            env.node_logs_dir("node1"),
            PathBuf::from("/tmp/castle/logs/node1")
        );
    }

    #[test]
    fn relative_working_directory_is_made_absolute() {
        let env = CastleEnvironment::new("out").unwrap();
        assert!(env.working_directory().is_absolute());
        assert!(env.working_directory().ends_with("out"));
    }
}
