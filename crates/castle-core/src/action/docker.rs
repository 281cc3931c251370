//! Lifecycle actions for nodes backed by docker containers.

use std::sync::Arc;

use super::types::{DAEMON_STOP, DOCKER_DESTROY, DOCKER_INIT, SAVE_LOGS, UPLINK_CHECK};
use super::{Action, ActionId, ActionMeta, TargetId};
use crate::cloud::docker::{DockerCloud, DOCKER_CLOUD_KEY};
use crate::cluster::{CastleCluster, CastleNode};
use crate::return_code::CastleReturnCode;
use crate::role::RoleKind;
use crate::shutdown::{ShutdownHook, WriteClusterFileHook};

pub fn create_actions(scope: &str) -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(DockerInit {
            meta: ActionMeta::new(ActionId::new(DOCKER_INIT, scope), vec![], &[], 0),
        }),
        Arc::new(DockerDestroy {
            meta: ActionMeta::new(
                ActionId::new(DOCKER_DESTROY, scope),
                vec![TargetId::new(SAVE_LOGS, scope), TargetId::all(DAEMON_STOP)],
                &[],
                0,
            ),
        }),
        Arc::new(UplinkCheck::new(scope)),
    ]
}

struct DockerInit {
    meta: ActionMeta,
}

impl Action for DockerInit {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if node.uplink().started(node) {
            node.log().info(&format!(
                "*** Skipping {DOCKER_INIT}, because the node is already running."
            ));
            return Ok(());
        }
        // Don't leak a container if the run fails after this point.
        cluster
            .shutdown_manager()
            .add_hook_if_missing(Arc::new(DestroyDockerInstancesHook));
        node.uplink().startup(cluster, node)?;
        cluster.write_cluster_file()?;
        Ok(())
    }
}

struct DockerDestroy {
    meta: ActionMeta,
}

impl Action for DockerDestroy {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().started(node) {
            node.log().info(&format!(
                "*** Skipping {DOCKER_DESTROY}, because the node is not running."
            ));
            return Ok(());
        }
        node.uplink().shutdown(node)?.wait()?;
        node.update_docker_role(|r| {
            r.container_name.clear();
            r.ssh_port = 0;
            r.ssh_identity_path.clear();
        });
        let manager = cluster.shutdown_manager();
        manager.add_hook_if_missing(Arc::new(WriteClusterFileHook));
        manager.add_hook_if_missing(Arc::new(CleanupDockerNetworkHook {
            node: node.name().to_string(),
        }));
        Ok(())
    }
}

/// Asks the node's uplink whether its machine still exists.
pub(crate) struct UplinkCheck {
    meta: ActionMeta,
}

impl UplinkCheck {
    pub(crate) fn new(scope: &str) -> Self {
        Self {
            meta: ActionMeta::new(ActionId::new(UPLINK_CHECK, scope), vec![], &[], 0),
        }
    }
}

impl Action for UplinkCheck {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        node.uplink().check(node)
    }
}

/// On success, records the new containers in the cluster file. On failure,
/// removes every container this cluster started.
struct DestroyDockerInstancesHook;

impl DestroyDockerInstancesHook {
    fn terminate(cluster: &CastleCluster) -> anyhow::Result<()> {
        for node in cluster.nodes().values() {
            let started = node
                .docker_role()
                .is_some_and(|r| !r.container_name.is_empty());
            if started {
                node.uplink().shutdown(node)?.wait()?;
            }
        }
        tracing::info!("terminated docker nodes");
        Ok(())
    }
}

impl ShutdownHook for DestroyDockerInstancesHook {
    fn name(&self) -> &str {
        "DestroyDockerInstancesHook"
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

/// Removes the docker network once no docker node can be logged into.
struct CleanupDockerNetworkHook {
    node: String,
}

impl ShutdownHook for CleanupDockerNetworkHook {
    fn name(&self) -> &str {
        "CleanupDockerNetworkHook"
    }

    fn run(&self, cluster: &CastleCluster, _code: CastleReturnCode) -> anyhow::Result<()> {
        for name in cluster.nodes_with_role(RoleKind::DockerNode).values() {
            if let Some(node) = cluster.node(name) {
                if node.uplink().can_login(node) {
                    return Ok(());
                }
            }
        }
        let Some(node) = cluster.node(&self.node) else {
            anyhow::bail!("unknown node {}", self.node);
        };
        let cloud = cluster
            .cloud_cache()
            .get_or_create(DOCKER_CLOUD_KEY, || Ok(DockerCloud::new()))?;
        cloud.cleanup_network(node)?;
        Ok(())
    }
}
