//! Lifecycle registry for a single castle run.
//!
//! The top-level run owns one `ShutdownManager` and hands it down through the
//! cluster. Actions register hooks (write the cluster file, destroy leaked
//! instances, remove the docker network) and fold their verdicts into the
//! return code. Hooks run exactly once, in registration order, on both the
//! success and the failure path.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cluster::CastleCluster;
use crate::return_code::CastleReturnCode;

pub trait ShutdownHook: Send + Sync {
    /// Hooks are deduplicated by name.
    fn name(&self) -> &str;

    fn run(&self, cluster: &CastleCluster, code: CastleReturnCode) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct ShutdownManager {
    return_code: AtomicU8,
    hooks: Mutex<Vec<Arc<dyn ShutdownHook>>>,
    finished: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn return_code(&self) -> CastleReturnCode {
        CastleReturnCode::from_u8(self.return_code.load(Ordering::SeqCst))
    }

    /// Raise the return code to `code` if it is more severe than the current one.
    pub fn change_return_code(&self, code: CastleReturnCode) {
        self.return_code
            .fetch_max(code.code() as u8, Ordering::SeqCst);
    }

    /// Register `hook` unless a hook with the same name is already present.
    /// Returns true if the hook was added.
    pub fn add_hook_if_missing(&self, hook: Arc<dyn ShutdownHook>) -> bool {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        if hooks.iter().any(|h| h.name() == hook.name()) {
            return false;
        }
        tracing::debug!(hook = hook.name(), "registered shutdown hook");
        hooks.push(hook);
        true
    }

    pub fn hook_names(&self) -> Vec<String> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Run every registered hook once and return the final return code.
    ///
    /// A failing hook is logged and raises the code to `ToolFailed`; later
    /// hooks still run. Calling this again is a no-op.
    pub fn shutdown(&self, cluster: &CastleCluster) -> CastleReturnCode {
        if self.finished.swap(true, Ordering::SeqCst) {
            return self.return_code();
        }
        let hooks: Vec<Arc<dyn ShutdownHook>> = self
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let code = self.return_code();
        for hook in hooks {
            tracing::debug!(hook = hook.name(), %code, "running shutdown hook");
            if let Err(e) = hook.run(cluster, code) {
                tracing::error!(hook = hook.name(), "shutdown hook failed: {e:#}");
                self.change_return_code(CastleReturnCode::ToolFailed);
            }
        }
        self.return_code()
    }
}

/// Rewrites the cluster file with the final state of every node.
pub struct WriteClusterFileHook;

impl ShutdownHook for WriteClusterFileHook {
    fn name(&self) -> &str {
        "WriteClusterFileHook"
    }

    fn run(&self, cluster: &CastleCluster, _code: CastleReturnCode) -> anyhow::Result<()> {
        cluster.write_cluster_file()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_cluster;
    use std::sync::atomic::AtomicUsize;

    struct CountingHook {
        name: &'static str,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ShutdownHook for CountingHook {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, _cluster: &CastleCluster, _code: CastleReturnCode) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("hook {} failed", self.name);
            }
            Ok(())
        }
    }

    fn hook(name: &'static str, runs: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn ShutdownHook> {
        Arc::new(CountingHook {
            name,
            runs: Arc::clone(runs),
            fail,
        })
    }

    #[test]
    fn return_code_only_gets_worse() {
        let mgr = ShutdownManager::new();
        assert_eq!(mgr.return_code(), CastleReturnCode::Success);
        mgr.change_return_code(CastleReturnCode::ClusterFailed);
        mgr.change_return_code(CastleReturnCode::InProgress);
        assert_eq!(mgr.return_code(), CastleReturnCode::ClusterFailed);
    }

    #[test]
    fn hooks_are_deduplicated_by_name() {
        let mgr = ShutdownManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(mgr.add_hook_if_missing(hook("a", &runs, false)));
        assert!(!mgr.add_hook_if_missing(hook("a", &runs, false)));
        assert!(mgr.add_hook_if_missing(hook("b", &runs, false)));
        assert_eq!(mgr.hook_names(), vec!["a", "b"]);
    }

    #[test]
    fn shutdown_runs_hooks_once_and_records_failures() {
        let (_dir, cluster) = test_cluster();
        let mgr = ShutdownManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        mgr.add_hook_if_missing(hook("fails", &runs, true));
        mgr.add_hook_if_missing(hook("after", &runs, false));
        assert_eq!(mgr.shutdown(&cluster), CastleReturnCode::ToolFailed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        mgr.shutdown(&cluster);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_cluster_file_hook_writes_the_file() {
        let (_dir, cluster) = test_cluster();
        let path = cluster.env().cluster_output_path();
        assert!(!path.exists());
        WriteClusterFileHook
            .run(&cluster, CastleReturnCode::ToolFailed)
            .unwrap();
        assert!(path.exists());
    }
}
