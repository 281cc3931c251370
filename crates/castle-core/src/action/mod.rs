//! Actions: the schedulable units of work.
//!
//! An `Action` is identified by an [`ActionId`] (type + node scope), declares
//! the [`TargetId`]s it depends on and the same-node action types it comes
//! after, and exposes a single blocking `call` against its node. The
//! [`graph`] module turns a flat set of actions into a dependency graph and
//! the [`scheduler`] module executes the closure of requested targets.

use std::fmt;
use std::time::Duration;

use crate::cluster::{CastleCluster, CastleNode};

pub mod aws;
pub mod collectd;
pub mod daemon;
pub mod docker;
pub mod graph;
pub mod logs;
pub mod paths;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod types;

pub use graph::ActionDependencyGraph;
pub use scheduler::{ActionRecord, ActionScheduler, ActionStatus, SchedulerReport};

// ---------------------------------------------------------------------------
// ActionId
// ---------------------------------------------------------------------------

/// Unique key of an action: its type and the node it is scoped to.
///
/// Ordered lexicographically by `(action_type, scope)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId {
    action_type: String,
    scope: String,
}

impl ActionId {
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            scope: scope.into(),
        }
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.action_type, self.scope)
    }
}

// ---------------------------------------------------------------------------
// TargetId
// ---------------------------------------------------------------------------

/// Selector over action ids. An empty scope matches every scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId {
    action_type: String,
    scope: String,
}

impl TargetId {
    pub fn new(action_type: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            scope: scope.into(),
        }
    }

    /// A target matching every instance of `action_type`.
    pub fn all(action_type: impl Into<String>) -> Self {
        Self::new(action_type, "")
    }

    /// Parse a CLI target name: `type` or `type:scope`.
    pub fn parse(name: &str) -> Self {
        match name.split_once(':') {
            Some((action_type, scope)) => Self::new(action_type, scope),
            None => Self::all(name),
        }
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn matches(&self, id: &ActionId) -> bool {
        self.action_type == id.action_type && (self.scope.is_empty() || self.scope == id.scope)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scope.is_empty() {
            f.write_str(&self.action_type)
        } else {
            write!(f, "{}:{}", self.action_type, self.scope)
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The fixed scheduling metadata every action carries.
#[derive(Debug, Clone)]
pub struct ActionMeta {
    id: ActionId,
    targets: Vec<TargetId>,
    comes_after: Vec<String>,
    initial_delay: Duration,
}

impl ActionMeta {
    pub fn new(
        id: ActionId,
        targets: Vec<TargetId>,
        comes_after: &[&str],
        initial_delay_ms: u64,
    ) -> Self {
        Self {
            id,
            targets,
            comes_after: comes_after.iter().map(|s| s.to_string()).collect(),
            initial_delay: Duration::from_millis(initial_delay_ms),
        }
    }
}

/// A unit of work scoped to one node.
///
/// `call` runs on its own blocking thread and is invoked at most once per
/// scheduling run, after every predecessor has finished successfully and the
/// initial delay has elapsed. Returning an error marks the action failed and
/// skips everything that depends on it; the scheduler never retries.
pub trait Action: Send + Sync {
    fn meta(&self) -> &ActionMeta;

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()>;

    fn id(&self) -> &ActionId {
        &self.meta().id
    }

    /// Cross-node dependencies.
    fn targets(&self) -> &[TargetId] {
        &self.meta().targets
    }

    /// Action types which must run first when present on the same node.
    fn comes_after(&self) -> &[String] {
        &self.meta().comes_after
    }

    fn initial_delay(&self) -> Duration {
        self.meta().initial_delay
    }
}
