use anyhow::Context;

use super::paths::LOGS_ROOT;
use super::types::{CLEAN, DAEMON_STOP, SAVE_LOGS};
use super::{Action, ActionId, ActionMeta, TargetId};
use crate::cluster::{CastleCluster, CastleNode};
use crate::error::CastleError;

/// Copies the node's log directory into `<wd>/logs/<node>/`.
pub struct SaveLogs {
    meta: ActionMeta,
}

impl SaveLogs {
    pub fn new(scope: &str) -> Self {
        Self {
            meta: ActionMeta::new(
                ActionId::new(SAVE_LOGS, scope),
                vec![TargetId::new(DAEMON_STOP, scope)],
                &[],
                0,
            ),
        }
    }
}

impl Action for SaveLogs {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().started(node) {
            node.log()
                .info("*** Skipping saveLogs, because the node is not running.");
            return Ok(());
        }
        let dest = cluster.env().node_logs_dir(node.name());
        std::fs::create_dir_all(&dest)
            .with_context(|| format!("unable to create {}", dest.display()))?;
        let ls = node.uplink().command(node).args(["ls", LOGS_ROOT]).run()?;
        match ls.status {
            0 => {
                node.uplink()
                    .command(node)
                    .sync_from(
                        format!("{LOGS_ROOT}/"),
                        format!("{}/", dest.to_string_lossy()),
                    )
                    .must_run()?;
            }
            // ls exits 1 or 2 when the directory is missing.
            1 | 2 => node.log().info(&format!(
                "*** Skipping saveLogs, because {LOGS_ROOT} was not found."
            )),
            code => {
                return Err(CastleError::CommandFailed {
                    command: format!("ls {LOGS_ROOT}"),
                    code,
                }
                .into())
            }
        }
        Ok(())
    }
}

/// Wipes data and logs off the node.
pub struct Clean {
    meta: ActionMeta,
}

impl Clean {
    pub fn new(scope: &str) -> Self {
        Self {
            meta: ActionMeta::new(
                ActionId::new(CLEAN, scope),
                vec![TargetId::all(DAEMON_STOP), TargetId::all(SAVE_LOGS)],
                &[],
                0,
            ),
        }
    }
}

impl Action for Clean {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().can_login(node) {
            node.log()
                .info("*** Skipping clean, because we can't log into the node.");
            return Ok(());
        }
        node.uplink()
            .command(node)
            .args(["sudo", "rm", "-rf", "--", "/mnt/*"])
            .must_run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_cluster;

    #[test]
    fn save_logs_skips_a_stopped_node() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node1").unwrap();
        SaveLogs::new("node1").call(&cluster, node).unwrap();
        assert!(!cluster.env().node_logs_dir("node1").exists());
    }

    #[test]
    fn clean_runs_after_every_save() {
        let clean = Clean::new("node0");
        assert!(clean.targets().contains(&TargetId::all("saveLogs")));
        let (_dir, cluster) = test_cluster();
        clean.call(&cluster, cluster.node("node0").unwrap()).unwrap();
    }
}
