//! The live cluster: nodes, their roles and uplinks, and the shared
//! per-run resources (cloud cache, lifecycle registry, environment).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::action::registry::registry_actions;
use crate::action::{Action, ActionScheduler};
use crate::cloud::CloudCache;
use crate::env::CastleEnvironment;
use crate::error::{CastleError, Result};
use crate::io::atomic_write;
use crate::json_merge;
use crate::role::{Role, RoleKind};
use crate::shutdown::ShutdownManager;
use crate::uplink::Uplink;

mod log;
mod node;
pub mod spec;

pub use log::NodeLog;
pub use node::CastleNode;
pub use spec::{CastleClusterConf, CastleClusterSpec, CastleNodeSpec};

pub const BROKER_PORT: u16 = 9092;
pub const ZOOKEEPER_PORT: u16 = 2181;

pub struct CastleCluster {
    conf: CastleClusterConf,
    env: CastleEnvironment,
    nodes: BTreeMap<String, CastleNode>,
    /// Role JSON exactly as read, before per-node patches.
    original_roles: BTreeMap<String, Value>,
    cloud_cache: CloudCache,
    shutdown_manager: Arc<ShutdownManager>,
}

impl CastleCluster {
    pub fn new(
        env: CastleEnvironment,
        shutdown_manager: Arc<ShutdownManager>,
        spec: CastleClusterSpec,
    ) -> Result<Self> {
        let cloud_cache = CloudCache::new();
        let mut nodes = BTreeMap::new();
        for (index, (name, named_roles)) in spec.nodes_to_roles()?.into_iter().enumerate() {
            let uplink = create_uplink(&name, &named_roles, &cloud_cache, &env)?;
            let log = NodeLog::new(name.clone(), env.node_log_path(&name));
            let node = CastleNode::new(index, name.clone(), named_roles, uplink, log);
            nodes.insert(name, node);
        }
        tracing::debug!(nodes = nodes.len(), "built cluster");
        Ok(Self {
            conf: spec.conf,
            env,
            nodes,
            original_roles: spec.roles,
            cloud_cache,
            shutdown_manager,
        })
    }

    pub fn conf(&self) -> &CastleClusterConf {
        &self.conf
    }

    pub fn env(&self) -> &CastleEnvironment {
        &self.env
    }

    pub fn cloud_cache(&self) -> &CloudCache {
        &self.cloud_cache
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown_manager
    }

    pub fn nodes(&self) -> &BTreeMap<String, CastleNode> {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&CastleNode> {
        self.nodes.get(name)
    }

    /// Nodes carrying a role of `kind`, keyed by node index.
    pub fn nodes_with_role(&self, kind: RoleKind) -> BTreeMap<usize, String> {
        self.nodes
            .values()
            .filter(|n| n.has_role(kind))
            .map(|n| (n.index(), n.name().to_string()))
            .collect()
    }

    fn endpoints(&self, kind: RoleKind, port: u16) -> String {
        self.nodes_with_role(kind)
            .values()
            .filter_map(|name| self.nodes.get(name))
            .map(|n| format!("{}:{port}", n.uplink().internal_dns(n)))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn bootstrap_servers(&self) -> String {
        self.endpoints(RoleKind::Broker, BROKER_PORT)
    }

    pub fn zookeeper_connect(&self) -> String {
        self.endpoints(RoleKind::ZooKeeper, ZOOKEEPER_PORT)
    }

    /// Translate a node name or a numeric node index into a node name.
    pub fn node_by_name_or_index(&self, arg: &str) -> Result<String> {
        if self.nodes.contains_key(arg) {
            return Ok(arg.to_string());
        }
        let index: usize = arg
            .parse()
            .map_err(|_| CastleError::UnknownNode(format!("unable to find a node named {arg}")))?;
        self.nodes.keys().nth(index).cloned().ok_or_else(|| {
            CastleError::UnknownNode(format!(
                "unable to find a node with index {index}; we have only {} node(s)",
                self.nodes.len()
            ))
        })
    }

    /// Resolve CLI node arguments. `all` selects every node and cannot be
    /// combined with other names.
    pub fn node_names_or_indices<S: AsRef<str>>(&self, args: &[S]) -> Result<Vec<String>> {
        if args.iter().any(|a| a.as_ref() == "all") {
            if args.len() > 1 {
                return Err(CastleError::Usage(
                    "Can't specify both 'all' and other node name(s).".to_string(),
                ));
            }
            return Ok(self.nodes.keys().cloned().collect());
        }
        let mut names = std::collections::BTreeSet::new();
        for arg in args {
            names.insert(self.node_by_name_or_index(arg.as_ref())?);
        }
        Ok(names.into_iter().collect())
    }

    /// Snapshot the live cluster as a spec.
    ///
    /// Node role names keep their original order. Each role whose current
    /// state differs from the role definition gets a patch, so merging the
    /// patch back onto the definition reproduces the node's role.
    pub fn to_spec(&self) -> Result<CastleClusterSpec> {
        let mut nodes = BTreeMap::new();
        for node in self.nodes.values() {
            let mut node_spec = CastleNodeSpec::default();
            for (role_name, kind) in node.named_role_kinds() {
                node_spec.role_names.push(role_name.clone());
                let Some(current) = node.role(*kind) else {
                    continue;
                };
                let current = current.to_json()?;
                if let Some(patch) =
                    json_merge::delta(self.original_roles.get(role_name), Some(&current))
                {
                    node_spec.role_patches.insert(role_name.clone(), patch);
                }
            }
            nodes.insert(node.name().to_string(), node_spec);
        }
        Ok(CastleClusterSpec {
            conf: self.conf.clone(),
            nodes,
            roles: self.original_roles.clone(),
        })
    }

    /// Write `to_spec()` to the working directory's cluster file.
    pub fn write_cluster_file(&self) -> Result<PathBuf> {
        let path = self.env.cluster_output_path();
        let data = serde_json::to_vec_pretty(&self.to_spec()?)?;
        atomic_write(&path, &data)?;
        tracing::info!(path = %path.display(), "wrote cluster file");
        Ok(path)
    }

    /// Build a scheduler over the registry actions, every role action in the
    /// cluster, and `extra`.
    pub fn create_scheduler<S: AsRef<str>>(
        self: &Arc<Self>,
        target_names: &[S],
        extra: Vec<Arc<dyn Action>>,
    ) -> Result<ActionScheduler> {
        let mut builder = ActionScheduler::builder(Arc::clone(self))
            .add_target_names(target_names.iter().map(|t| t.as_ref().to_string()))
            .add_actions(registry_actions(self.nodes.keys().map(String::as_str)))
            .add_actions(extra);
        for node in self.nodes.values() {
            for role in node.roles() {
                builder = builder.add_actions(role.create_actions(node.name()));
            }
        }
        builder.build()
    }

    /// Close the cloud clients and node logs. Safe to call more than once.
    pub fn close(&self) {
        self.cloud_cache.close();
        for node in self.nodes.values() {
            node.close();
        }
    }
}

fn create_uplink(
    node: &str,
    roles: &[(String, Role)],
    clouds: &CloudCache,
    env: &CastleEnvironment,
) -> Result<Arc<dyn Uplink>> {
    let mut found: Option<&Role> = None;
    for (_, role) in roles {
        if role.uplink_factory().is_none() {
            continue;
        }
        if let Some(first) = found {
            return Err(CastleError::DuplicateUplinkRole {
                node: node.to_string(),
                first: first.kind().to_string(),
                second: role.kind().to_string(),
            });
        }
        found = Some(role);
    }
    let factory = found
        .and_then(Role::uplink_factory)
        .ok_or_else(|| CastleError::MissingUplinkRole(node.to_string()))?;
    factory.create_uplink(clouds, env)
}
