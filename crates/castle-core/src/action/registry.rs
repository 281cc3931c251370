//! Per-node actions which every cluster has regardless of roles.
//!
//! Most of them are umbrellas: they do nothing themselves and exist so a user
//! can ask for `up` or `down` and get the right closure of role actions.

use std::sync::Arc;

use super::logs::{Clean, SaveLogs};
use super::types::*;
use super::{Action, ActionId, ActionMeta};
use crate::cluster::{CastleCluster, CastleNode};

/// An action whose only job is to gather its predecessors under one name.
struct Umbrella {
    meta: ActionMeta,
}

impl Umbrella {
    fn new(action_type: &str, scope: &str, comes_after: &[&str]) -> Arc<dyn Action> {
        Arc::new(Self {
            meta: ActionMeta::new(ActionId::new(action_type, scope), vec![], comes_after, 0),
        })
    }
}

impl Action for Umbrella {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, _node: &CastleNode) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Destroys every machine the node's uplink backend can find.
struct DestroyNodes {
    meta: ActionMeta,
}

impl Action for DestroyNodes {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        node.log().info(&format!(
            "*** {}: Destroying all the nodes for uplink {}.",
            node.name(),
            node.uplink().name()
        ));
        node.uplink().shutdown_all(node)
    }
}

/// The registry actions for one node.
pub fn node_actions(scope: &str) -> Vec<Arc<dyn Action>> {
    let mut daemon_starts = vec![SETUP];
    daemon_starts.extend([
        ZOOKEEPER_START,
        BROKER_START,
        TROGDOR_AGENT_START,
        TROGDOR_COORDINATOR_START,
        JMX_START,
    ]);
    let mut daemon_stops = vec![TASK_STOP];
    daemon_stops.extend(DAEMON_STOPS);
    vec![
        Umbrella::new(INIT, scope, &[DOCKER_INIT, AWS_INIT]),
        Umbrella::new(SETUP, scope, &[INIT]),
        Umbrella::new(DAEMON_START, scope, &daemon_starts),
        Umbrella::new(START, scope, &[DAEMON_START, TASK_START]),
        Umbrella::new(UP, scope, &[START]),
        Umbrella::new(
            DAEMON_STATUS,
            scope,
            &[
                UPLINK_CHECK,
                ZOOKEEPER_STATUS,
                BROKER_STATUS,
                TROGDOR_AGENT_STATUS,
                TROGDOR_COORDINATOR_STATUS,
                JMX_STATUS,
            ],
        ),
        Umbrella::new(STATUS, scope, &[DAEMON_STATUS, TASK_STATUS]),
        Umbrella::new(DAEMON_STOP, scope, &daemon_stops),
        Umbrella::new(STOP, scope, &[DAEMON_STOP]),
        Arc::new(SaveLogs::new(scope)),
        Arc::new(Clean::new(scope)),
        Umbrella::new(DESTROY, scope, &[DOCKER_DESTROY, AWS_DESTROY]),
        Umbrella::new(DOWN, scope, &[DESTROY, SAVE_LOGS, STOP]),
        Arc::new(DestroyNodes {
            meta: ActionMeta::new(ActionId::new(DESTROY_NODES, scope), vec![], &[], 0),
        }),
    ]
}

/// The registry actions for every node in `scopes`.
pub fn registry_actions<'a>(scopes: impl IntoIterator<Item = &'a str>) -> Vec<Arc<dyn Action>> {
    scopes.into_iter().flat_map(node_actions).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDependencyGraph, TargetId};
    use crate::cluster::CastleClusterSpec;
    use crate::testing::{cluster_of, test_cluster};

    fn graph() -> ActionDependencyGraph {
        let (_dir, cluster) = test_cluster();
        graph_of(&cluster)
    }

    fn graph_of(cluster: &CastleCluster) -> ActionDependencyGraph {
        let mut actions = registry_actions(cluster.nodes().keys().map(String::as_str));
        for node in cluster.nodes().values() {
            for role in node.roles() {
                actions.extend(role.create_actions(node.name()));
            }
        }
        ActionDependencyGraph::new(actions).unwrap()
    }

    fn types(ids: &std::collections::BTreeSet<ActionId>, scope: &str) -> Vec<String> {
        ids.iter()
            .filter(|id| id.scope() == scope)
            .map(|id| id.action_type().to_string())
            .collect()
    }

    #[test]
    fn up_pulls_in_init_and_every_daemon() {
        let graph = graph();
        let up = graph.resolve_name("up").unwrap();
        let node3 = types(&up, "node3");
        for expected in [
            "dockerInit",
            "init",
            "setup",
            "zooKeeperStart",
            "trogdorCoordinatorStart",
            "daemonStart",
            "start",
            "up",
        ] {
            assert!(node3.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(types(&up, "node0").contains(&"brokerStart".to_string()));
        assert!(!up.iter().any(|id| id.action_type() == "brokerStop"));
    }

    #[test]
    fn down_stops_daemons_in_reverse_order() {
        let graph = graph();
        let down = graph.resolve_name("down").unwrap();
        assert!(down.contains(&ActionId::new("dockerDestroy", "node0")));
        assert!(down.contains(&ActionId::new("saveLogs", "node3")));
        assert!(graph
            .predecessors_of(&ActionId::new("zooKeeperStop", "node3"))
            .contains(&ActionId::new("brokerStop", "node1")));
        assert!(graph
            .predecessors_of(&ActionId::new("brokerStop", "node1"))
            .contains(&ActionId::new("trogdorCoordinatorStop", "node3")));
        assert!(!down.iter().any(|id| id.action_type() == "clean"));
    }

    #[test]
    fn scoped_save_logs_only_stops_what_it_depends_on() {
        let graph = graph();
        let save = graph.resolve(&TargetId::new("saveLogs", "node0"));
        assert!(save.contains(&ActionId::new("brokerStop", "node0")));
        assert!(!save.contains(&ActionId::new("zooKeeperStop", "node3")));
        assert!(!save.iter().any(|id| id.action_type() == "dockerDestroy"));
    }

    #[test]
    fn destroy_nodes_is_not_part_of_down() {
        let graph = graph();
        assert!(!graph
            .resolve_name("down")
            .unwrap()
            .iter()
            .any(|id| id.action_type() == DESTROY_NODES));
        assert_eq!(graph.resolve_name("destroyNodes").unwrap().len(), 4);
    }

    #[test]
    fn monitoring_daemons_join_the_umbrellas() {
        let text = serde_json::json!({
            "nodes": {
                "node0": {"roleNames": ["zooKeeper", "broker", "jmx", "collectd", "docker"]}
            },
            "roles": {
                "zooKeeper": {"type": "zooKeeper"},
                "broker": {"type": "broker"},
                "jmx": {"type": "jmxDumper", "conf": {"objects": []}},
                "collectd": {"type": "collectd"},
                "docker": {"type": "dockerNode", "imageId": "castle-ubuntu"}
            }
        })
        .to_string();
        let (_dir, cluster) = cluster_of(CastleClusterSpec::parse(&text, |_| None).unwrap());
        let graph = graph_of(&cluster);
        let up = graph.resolve_name("up").unwrap();
        assert!(up.contains(&ActionId::new("jmxStart", "node0")));
        assert!(graph
            .predecessors_of(&ActionId::new("jmxStart", "node0"))
            .contains(&ActionId::new("brokerStart", "node0")));
        let status = graph.resolve_name("daemonStatus").unwrap();
        assert!(status.contains(&ActionId::new("jmxStatus", "node0")));
        let down = graph.resolve_name("down").unwrap();
        assert!(down.contains(&ActionId::new("collectdStop", "node0")));
        assert!(graph
            .predecessors_of(&ActionId::new("brokerStop", "node0"))
            .contains(&ActionId::new("jmxStop", "node0")));
    }
}
