//! Fixtures shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use crate::action::{Action, ActionId, ActionMeta, TargetId};
use crate::cluster::{CastleCluster, CastleClusterSpec, CastleNode};
use crate::env::CastleEnvironment;
use crate::shutdown::ShutdownManager;

/// Three broker/agent nodes plus one zookeeper/coordinator node, all backed
/// by docker containers which have not been started.
pub(crate) fn test_spec() -> CastleClusterSpec {
    let text = json!({
        "conf": {"kafkaPath": "/src/kafka"},
        "nodes": {
            "node[0-2]": {"roleNames": ["broker", "trogdorAgent", "docker"]},
            "node3": {"roleNames": ["zooKeeper", "trogdorCoordinator", "docker"]}
        },
        "roles": {
            "broker": {"type": "broker"},
            "trogdorAgent": {"type": "trogdorAgent"},
            "zooKeeper": {"type": "zooKeeper"},
            "trogdorCoordinator": {"type": "trogdorCoordinator"},
            "docker": {"type": "dockerNode", "imageId": "castle-ubuntu", "dockerUser": "ducker"}
        }
    })
    .to_string();
    CastleClusterSpec::parse(&text, |_| None).unwrap()
}

pub(crate) fn test_cluster() -> (TempDir, CastleCluster) {
    cluster_of(test_spec())
}

pub(crate) fn cluster_of(spec: CastleClusterSpec) -> (TempDir, CastleCluster) {
    let dir = TempDir::new().unwrap();
    let env = CastleEnvironment::new(dir.path()).unwrap();
    let cluster = CastleCluster::new(env, Arc::new(ShutdownManager::new()), spec).unwrap();
    (dir, cluster)
}

/// Builder for scripted actions.
pub(crate) struct TestAction {
    action_type: String,
    scope: String,
    targets: Vec<TargetId>,
    comes_after: Vec<&'static str>,
    delay_ms: u64,
    fails: Option<String>,
    gate: Option<Arc<AtomicBool>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl TestAction {
    pub(crate) fn new(action_type: &str, scope: &str) -> Self {
        Self {
            action_type: action_type.to_string(),
            scope: scope.to_string(),
            targets: Vec::new(),
            comes_after: Vec::new(),
            delay_ms: 0,
            fails: None,
            gate: None,
            journal: None,
        }
    }

    pub(crate) fn targets(mut self, targets: Vec<TargetId>) -> Self {
        self.targets = targets;
        self
    }

    pub(crate) fn comes_after(mut self, types: &[&'static str]) -> Self {
        self.comes_after = types.to_vec();
        self
    }

    pub(crate) fn delay_ms(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub(crate) fn fails(mut self, msg: &str) -> Self {
        self.fails = Some(msg.to_string());
        self
    }

    /// Block inside `call` until `gate` is set.
    pub(crate) fn blocks_until(mut self, gate: Arc<AtomicBool>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Append the action id to `journal` when `call` starts.
    pub(crate) fn records(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub(crate) fn build(self) -> Arc<dyn Action> {
        Arc::new(ScriptedAction {
            meta: ActionMeta::new(
                ActionId::new(self.action_type, self.scope),
                self.targets,
                &self.comes_after,
                self.delay_ms,
            ),
            fails: self.fails,
            gate: self.gate,
            journal: self.journal,
        })
    }
}

struct ScriptedAction {
    meta: ActionMeta,
    fails: Option<String>,
    gate: Option<Arc<AtomicBool>>,
    journal: Option<Arc<Mutex<Vec<String>>>>,
}

impl Action for ScriptedAction {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, _node: &CastleNode) -> anyhow::Result<()> {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(self.id().to_string());
        }
        if let Some(gate) = &self.gate {
            while !gate.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        match &self.fails {
            Some(msg) => Err(anyhow::anyhow!("{msg}")),
            None => Ok(()),
        }
    }
}
