//! Roles: per-node capability bundles.
//!
//! `Role` is a closed tagged union keyed by the `type` field of the role's
//! JSON. Callers never test for a concrete kind to find behavior; they ask a
//! role for a capability (`uplink_factory`, `create_actions`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action::daemon::DaemonKind;
use crate::action::Action;
use crate::cloud::CloudCache;
use crate::env::CastleEnvironment;
use crate::error::Result;
use crate::uplink::Uplink;

mod daemon;
mod node;

pub use daemon::{
    AdditionalFile, BrokerRole, CollectdRole, JmxDumperRole, TrogdorAgentRole,
    TrogdorCoordinatorRole, ZooKeeperRole,
};
pub use node::{AwsNodeRole, DockerNodeRole};

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleKind {
    Broker,
    ZooKeeper,
    TrogdorAgent,
    TrogdorCoordinator,
    JmxDumper,
    Collectd,
    Task,
    DockerNode,
    AwsNode,
}

impl RoleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Broker => "broker",
            RoleKind::ZooKeeper => "zooKeeper",
            RoleKind::TrogdorAgent => "trogdorAgent",
            RoleKind::TrogdorCoordinator => "trogdorCoordinator",
            RoleKind::JmxDumper => "jmxDumper",
            RoleKind::Collectd => "collectd",
            RoleKind::Task => "task",
            RoleKind::DockerNode => "dockerNode",
            RoleKind::AwsNode => "awsNode",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Role {
    Broker(BrokerRole),
    ZooKeeper(ZooKeeperRole),
    TrogdorAgent(TrogdorAgentRole),
    TrogdorCoordinator(TrogdorCoordinatorRole),
    JmxDumper(JmxDumperRole),
    Collectd(CollectdRole),
    Task(TaskRole),
    DockerNode(DockerNodeRole),
    AwsNode(AwsNodeRole),
}

/// A role which can open the remote-execution channel for its node.
pub trait UplinkRole {
    fn create_uplink(
        &self,
        clouds: &CloudCache,
        env: &CastleEnvironment,
    ) -> Result<Arc<dyn Uplink>>;
}

impl Role {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Broker(_) => RoleKind::Broker,
            Role::ZooKeeper(_) => RoleKind::ZooKeeper,
            Role::TrogdorAgent(_) => RoleKind::TrogdorAgent,
            Role::TrogdorCoordinator(_) => RoleKind::TrogdorCoordinator,
            Role::JmxDumper(_) => RoleKind::JmxDumper,
            Role::Collectd(_) => RoleKind::Collectd,
            Role::Task(_) => RoleKind::Task,
            Role::DockerNode(_) => RoleKind::DockerNode,
            Role::AwsNode(_) => RoleKind::AwsNode,
        }
    }

    /// The uplink capability, for roles that provide one.
    pub fn uplink_factory(&self) -> Option<&dyn UplinkRole> {
        match self {
            Role::DockerNode(r) => Some(r),
            Role::AwsNode(r) => Some(r),
            _ => None,
        }
    }

    /// The actions this role contributes to node `scope`.
    pub fn create_actions(&self, scope: &str) -> Vec<Arc<dyn Action>> {
        match self {
            Role::Broker(r) => {
                crate::action::daemon::create_actions(DaemonKind::Broker, scope, r.initial_delay_ms)
            }
            Role::ZooKeeper(r) => crate::action::daemon::create_actions(
                DaemonKind::ZooKeeper,
                scope,
                r.initial_delay_ms,
            ),
            Role::TrogdorAgent(r) => crate::action::daemon::create_actions(
                DaemonKind::TrogdorAgent,
                scope,
                r.initial_delay_ms,
            ),
            Role::TrogdorCoordinator(r) => crate::action::daemon::create_actions(
                DaemonKind::TrogdorCoordinator,
                scope,
                r.initial_delay_ms,
            ),
            Role::JmxDumper(r) => crate::action::daemon::create_actions(
                DaemonKind::JmxDumper,
                scope,
                r.initial_delay_ms,
            ),
            Role::Collectd(r) => crate::action::collectd::create_actions(scope, r.initial_delay_ms),
            Role::Task(r) => crate::action::task::create_actions(scope, r),
            Role::DockerNode(_) => crate::action::docker::create_actions(scope),
            Role::AwsNode(_) => crate::action::aws::create_actions(scope),
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Trogdor tasks submitted to the coordinator once the cluster is up.
///
/// String values inside a task spec may reference `%{bootstrapServers}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub task_specs: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_deserialize_by_type_tag() {
        let role: Role = serde_json::from_value(json!({
            "type": "dockerNode",
            "imageId": "castle-image",
            "sshPort": 2222
        }))
        .unwrap();
        assert_eq!(role.kind(), RoleKind::DockerNode);
        match &role {
            Role::DockerNode(d) => {
                assert_eq!(d.image_id, "castle-image");
                assert_eq!(d.ssh_port, 2222);
                assert!(d.container_name.is_empty());
            }
            other => panic!("unexpected role {other:?}"),
        }

        let role: Role = serde_json::from_value(json!({"type": "zooKeeper"})).unwrap();
        assert_eq!(role.kind(), RoleKind::ZooKeeper);
    }

    #[test]
    fn unknown_role_type_is_rejected() {
        let res: std::result::Result<Role, _> =
            serde_json::from_value(json!({"type": "kibana"}));
        assert!(res.is_err());
    }

    #[test]
    fn empty_fields_are_not_serialized() {
        let role: Role = serde_json::from_value(json!({"type": "dockerNode", "imageId": "img"}))
            .unwrap();
        assert_eq!(
            role.to_json().unwrap(),
            json!({"type": "dockerNode", "imageId": "img"})
        );
    }

    #[test]
    fn only_node_roles_provide_uplinks() {
        let docker: Role = serde_json::from_value(json!({"type": "dockerNode"})).unwrap();
        let aws: Role = serde_json::from_value(json!({"type": "awsNode"})).unwrap();
        let broker: Role = serde_json::from_value(json!({"type": "broker"})).unwrap();
        assert!(docker.uplink_factory().is_some());
        assert!(aws.uplink_factory().is_some());
        assert!(broker.uplink_factory().is_none());
    }

    #[test]
    fn monitoring_roles_create_their_actions() {
        let jmx: Role = serde_json::from_value(json!({
            "type": "jmxDumper",
            "initialDelayMs": 5000,
            "conf": {"localhost:9192": {"periodMs": 1000}}
        }))
        .unwrap();
        let ids: Vec<String> = jmx
            .create_actions("node1")
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(ids, vec!["jmxStart:node1", "jmxStatus:node1", "jmxStop:node1"]);
        assert_eq!(jmx.to_json().unwrap()["conf"]["localhost:9192"]["periodMs"], 1000);

        let collectd: Role = serde_json::from_value(json!({"type": "collectd"})).unwrap();
        assert_eq!(collectd.kind(), RoleKind::Collectd);
        let ids: Vec<String> = collectd
            .create_actions("node1")
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        assert_eq!(ids, vec!["collectdStop:node1"]);
    }

    #[test]
    fn broker_additional_files_round_trip() {
        let role: Role = serde_json::from_value(json!({
            "type": "broker",
            "additionalFiles": [{"local": "/tmp/jaas.conf", "remote": "/mnt/kafka/jaas.conf"}]
        }))
        .unwrap();
        match &role {
            Role::Broker(b) => assert_eq!(b.additional_files[0].remote, "/mnt/kafka/jaas.conf"),
            other => panic!("unexpected role {other:?}"),
        }
        assert_eq!(
            role.to_json().unwrap()["additionalFiles"][0]["local"],
            "/tmp/jaas.conf"
        );
    }

    #[test]
    fn task_role_creates_task_actions() {
        let role: Role = serde_json::from_value(json!({
            "type": "task",
            "initialDelayMs": 100,
            "taskSpecs": {"produce": {"class": "ProduceBenchSpec"}}
        }))
        .unwrap();
        let mut types: Vec<String> = role
            .create_actions("node3")
            .iter()
            .map(|a| a.id().to_string())
            .collect();
        types.sort();
        assert_eq!(
            types,
            vec!["taskStart:node3", "taskStatus:node3", "taskStop:node3"]
        );
    }
}
