use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::log::NodeLog;
use crate::role::{AwsNodeRole, DockerNodeRole, Role, RoleKind};
use crate::uplink::Uplink;

/// One member of a castle cluster.
///
/// Role state is mutable: actions running on this node record things like the
/// container name or instance id. Each node's roles are written only by that
/// node's own actions; other nodes read them after declaring a dependency on
/// the writer.
pub struct CastleNode {
    /// Position of the node in alphabetical order of names.
    index: usize,
    name: String,
    /// Role names as listed in the cluster file, paired with their kind.
    role_names: Vec<(String, RoleKind)>,
    roles: RwLock<BTreeMap<RoleKind, Role>>,
    uplink: Arc<dyn Uplink>,
    log: NodeLog,
}

impl CastleNode {
    pub(crate) fn new(
        index: usize,
        name: String,
        named_roles: Vec<(String, Role)>,
        uplink: Arc<dyn Uplink>,
        log: NodeLog,
    ) -> Self {
        let role_names = named_roles
            .iter()
            .map(|(n, r)| (n.clone(), r.kind()))
            .collect();
        let roles = named_roles
            .into_iter()
            .map(|(_, r)| (r.kind(), r))
            .collect();
        Self {
            index,
            name,
            role_names,
            roles: RwLock::new(roles),
            uplink,
            log,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role_names(&self) -> impl Iterator<Item = &str> {
        self.role_names.iter().map(|(n, _)| n.as_str())
    }

    pub(crate) fn named_role_kinds(&self) -> &[(String, RoleKind)] {
        &self.role_names
    }

    pub fn has_role(&self, kind: RoleKind) -> bool {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    /// A snapshot of the role of `kind`.
    pub fn role(&self, kind: RoleKind) -> Option<Role> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Snapshots of every role, ordered by kind.
    pub fn roles(&self) -> Vec<Role> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn update_role<R>(&self, kind: RoleKind, f: impl FnOnce(&mut Role) -> R) -> Option<R> {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        roles.get_mut(&kind).map(f)
    }

    pub fn docker_role(&self) -> Option<DockerNodeRole> {
        match self.role(RoleKind::DockerNode)? {
            Role::DockerNode(r) => Some(r),
            _ => None,
        }
    }

    pub fn update_docker_role<R>(&self, f: impl FnOnce(&mut DockerNodeRole) -> R) -> Option<R> {
        self.update_role(RoleKind::DockerNode, |role| match role {
            Role::DockerNode(r) => Some(f(r)),
            _ => None,
        })
        .flatten()
    }

    pub fn aws_role(&self) -> Option<AwsNodeRole> {
        match self.role(RoleKind::AwsNode)? {
            Role::AwsNode(r) => Some(r),
            _ => None,
        }
    }

    pub fn update_aws_role<R>(&self, f: impl FnOnce(&mut AwsNodeRole) -> R) -> Option<R> {
        self.update_role(RoleKind::AwsNode, |role| match role {
            Role::AwsNode(r) => Some(f(r)),
            _ => None,
        })
        .flatten()
    }

    pub fn uplink(&self) -> &dyn Uplink {
        self.uplink.as_ref()
    }

    pub fn log(&self) -> &NodeLog {
        &self.log
    }

    pub(crate) fn close(&self) {
        self.log.close();
    }
}

impl std::fmt::Debug for CastleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastleNode")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("role_names", &self.role_names)
            .finish()
    }
}
