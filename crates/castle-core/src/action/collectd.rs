//! Stopping the collectd daemon which node images run for host metrics.

use std::sync::Arc;
use std::time::Duration;

use super::paths::COLLECTD;
use super::types::COLLECTD_STOP;
use super::{Action, ActionId, ActionMeta};
use crate::cluster::{CastleCluster, CastleNode};
use crate::util::kill_process_args;

/// Time collectd gets to write out its buffered samples after SIGUSR1.
const FLUSH_DELAY: Duration = Duration::from_millis(2000);

pub fn create_actions(scope: &str, initial_delay_ms: u64) -> Vec<Arc<dyn Action>> {
    vec![Arc::new(CollectdStop {
        meta: ActionMeta::new(
            ActionId::new(COLLECTD_STOP, scope),
            vec![],
            &[],
            initial_delay_ms,
        ),
    })]
}

struct CollectdStop {
    meta: ActionMeta,
}

impl Action for CollectdStop {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().can_login(node) {
            node.log().info(&format!(
                "*** Skipping {COLLECTD_STOP}, because we can't log into the node."
            ));
            return Ok(());
        }
        node.uplink()
            .command(node)
            .args(kill_process_args(COLLECTD, "SIGUSR1"))
            .must_run()?;
        std::thread::sleep(FLUSH_DELAY);
        node.uplink()
            .command(node)
            .args(kill_process_args(COLLECTD, "SIGTERM"))
            .must_run()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::return_code::CastleReturnCode;
    use crate::testing::test_cluster;

    #[test]
    fn collectd_stop_has_no_prerequisites() {
        let actions = create_actions("node[0-2]", 0);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].id().to_string(), "collectdStop:node[0-2]");
        assert!(actions[0].targets().is_empty());
    }

    #[test]
    fn stop_without_login_is_skipped() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node1").unwrap();
        let actions = create_actions("node1", 0);
        actions[0].call(&cluster, node).unwrap();
        assert_eq!(
            cluster.shutdown_manager().return_code(),
            CastleReturnCode::Success
        );
    }
}
