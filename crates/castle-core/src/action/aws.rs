//! Lifecycle actions for nodes backed by EC2 instances.

use std::sync::Arc;

use super::docker::UplinkCheck;
use super::types::{AWS_DESTROY, AWS_INIT, DAEMON_STOP, SAVE_LOGS};
use super::{Action, ActionId, ActionMeta, TargetId};
use crate::cloud::wait_all;
use crate::cluster::{CastleCluster, CastleNode};
use crate::return_code::CastleReturnCode;
use crate::shutdown::{ShutdownHook, WriteClusterFileHook};

pub fn create_actions(scope: &str) -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(AwsInit {
            meta: ActionMeta::new(ActionId::new(AWS_INIT, scope), vec![], &[], 0),
        }),
        Arc::new(AwsDestroy {
            meta: ActionMeta::new(
                ActionId::new(AWS_DESTROY, scope),
                vec![TargetId::new(SAVE_LOGS, scope), TargetId::all(DAEMON_STOP)],
                &[],
                0,
            ),
        }),
        Arc::new(UplinkCheck::new(scope)),
    ]
}

struct AwsInit {
    meta: ActionMeta,
}

impl Action for AwsInit {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if node.uplink().started(node) {
            node.log().info(&format!(
                "*** Skipping {AWS_INIT}, because the node is already running."
            ));
            return Ok(());
        }
        // Don't leak an instance if the run fails after this point.
        cluster
            .shutdown_manager()
            .add_hook_if_missing(Arc::new(DestroyAwsInstancesHook));
        node.uplink().startup(cluster, node)?;
        cluster.write_cluster_file()?;
        Ok(())
    }
}

struct AwsDestroy {
    meta: ActionMeta,
}

impl Action for AwsDestroy {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().started(node) {
            node.log().info(&format!(
                "*** Skipping {AWS_DESTROY}, because the node is not running."
            ));
            return Ok(());
        }
        node.uplink().shutdown(node)?.wait()?;
        node.update_aws_role(|r| {
            r.instance_id.clear();
            r.private_dns.clear();
            r.public_dns.clear();
        });
        cluster
            .shutdown_manager()
            .add_hook_if_missing(Arc::new(WriteClusterFileHook));
        Ok(())
    }
}

/// On success, records the new instances in the cluster file. On failure,
/// terminates every instance this cluster started.
struct DestroyAwsInstancesHook;

impl DestroyAwsInstancesHook {
    fn terminate(cluster: &CastleCluster) -> anyhow::Result<()> {
        let mut futures = Vec::new();
        for node in cluster.nodes().values() {
            let started = node.aws_role().is_some_and(|r| !r.instance_id.is_empty());
            if started {
                futures.push(node.uplink().shutdown(node)?);
            }
        }
        if !futures.is_empty() {
            wait_all(futures)?;
            tracing::info!("terminated AWS nodes");
        }
        Ok(())
    }
}

impl ShutdownHook for DestroyAwsInstancesHook {
    fn name(&self) -> &str {
        "DestroyAwsInstancesHook"
    }

    fn run(&self, cluster: &CastleCluster, code: CastleReturnCode) -> anyhow::Result<()> {
        if code != CastleReturnCode::Success {
            return Self::terminate(cluster);
        }
        if let Err(e) = cluster.write_cluster_file() {
            tracing::error!("failed to write the cluster file: {e}");
            Self::terminate(cluster)?;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_nodes_get_init_destroy_and_check() {
        let ids: Vec<String> = create_actions("node0")
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(ids, vec!["awsInit:node0", "awsDestroy:node0", "uplinkCheck:node0"]);
    }
}
