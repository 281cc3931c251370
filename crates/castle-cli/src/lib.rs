//! Argument handling shared by the `castle` binary and its tests.

use std::path::{Path, PathBuf};

use anyhow::bail;
use castle_core::env::CLUSTER_FILE_NAME;
use castle_core::ssh::SSH_COMMAND;

/// Pick the cluster file to read.
///
/// A `cluster.conf` left in the working directory by an earlier run is the
/// cluster's current state, so it always wins and an explicit `-c` is a
/// usage error. Otherwise `-c` is required and must exist.
pub fn resolve_cluster_path(
    working_directory: &Path,
    cluster: Option<&Path>,
) -> anyhow::Result<PathBuf> {
    let existing = working_directory.join(CLUSTER_FILE_NAME);
    if existing.exists() {
        if cluster.is_some() {
            bail!(
                "A cluster file named {} exists in your working directory. \
                 You must not specify a cluster path with -c or --cluster.",
                existing.display()
            );
        }
        return Ok(existing);
    }
    let Some(path) = cluster else {
        bail!("You must specify a cluster with -c or --cluster.");
    };
    if !path.exists() {
        bail!("The specified cluster path {} does not exist.", path.display());
    }
    Ok(path.to_path_buf())
}

/// True when the targets ask for `castle ssh`, which bypasses the scheduler.
pub fn is_ssh(targets: &[String]) -> bool {
    targets.first().is_some_and(|t| t == SSH_COMMAND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn existing_cluster_file_wins() {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join("cluster.conf");
        std::fs::write(&conf, "{}").unwrap();
        assert_eq!(resolve_cluster_path(dir.path(), None).unwrap(), conf);
        let err = resolve_cluster_path(dir.path(), Some(&conf)).unwrap_err();
        assert!(err.to_string().contains("must not specify a cluster path"));
    }

    #[test]
    fn cluster_flag_is_required_and_must_exist() {
        let dir = TempDir::new().unwrap();
        let err = resolve_cluster_path(dir.path(), None).unwrap_err();
        assert_eq!(err.to_string(), "You must specify a cluster with -c or --cluster.");
        let missing = dir.path().join("nope.json");
        let err = resolve_cluster_path(dir.path(), Some(&missing)).unwrap_err();
        assert!(err.to_string().ends_with("does not exist."));
    }

    #[test]
    fn ssh_is_only_recognized_first() {
        assert!(is_ssh(&["ssh".to_string(), "node0".to_string()]));
        assert!(!is_ssh(&["up".to_string(), "ssh".to_string()]));
        assert!(!is_ssh(&[]));
    }
}
