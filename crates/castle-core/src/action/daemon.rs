//! Start, status and stop actions for the JVM daemons castle manages,
//! including the JMX dumper which watches the brokers.
//!
//! Each daemon kind contributes three actions per node. Start renders the
//! daemon's configuration locally, pushes it to the node and launches the
//! daemon under `nohup`. Status folds what it finds into the run's return
//! code instead of failing. Stop sends SIGTERM, then SIGKILL if the process
//! outlives the grace period.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Map, Value};

use super::paths::{
    JMX_DUMPER_CONF, JMX_DUMPER_LOGS, JMX_DUMPER_ROOT, JMX_DUMPER_START_SCRIPT, KAFKA_CONF,
    KAFKA_DATA, KAFKA_LOGS, KAFKA_ROOT, KAFKA_SRC, TROGDOR_CONF, TROGDOR_LOGS, TROGDOR_ROOT,
    ZK_CONF, ZK_DATA, ZK_LOGS, ZK_ROOT,
};
use super::types::*;
use super::{Action, ActionId, ActionMeta, TargetId};
use crate::cluster::{CastleCluster, CastleNode, BROKER_PORT, ZOOKEEPER_PORT};
use crate::return_code::CastleReturnCode;
use crate::role::{AdditionalFile, Role, RoleKind};
use crate::util::{kill_process_args, merge_config, process_pid_args, wait_for};

pub const TROGDOR_AGENT_PORT: u16 = 8888;
pub const TROGDOR_COORDINATOR_PORT: u16 = 8889;

const PID_POLL: Duration = Duration::from_millis(200);
const START_MAX_WAIT: Duration = Duration::from_secs(60);
const STOP_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonKind {
    ZooKeeper,
    Broker,
    TrogdorAgent,
    TrogdorCoordinator,
    JmxDumper,
}

impl DaemonKind {
    pub fn role_kind(self) -> RoleKind {
        match self {
            DaemonKind::ZooKeeper => RoleKind::ZooKeeper,
            DaemonKind::Broker => RoleKind::Broker,
            DaemonKind::TrogdorAgent => RoleKind::TrogdorAgent,
            DaemonKind::TrogdorCoordinator => RoleKind::TrogdorCoordinator,
            DaemonKind::JmxDumper => RoleKind::JmxDumper,
        }
    }

    pub fn start_type(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZOOKEEPER_START,
            DaemonKind::Broker => BROKER_START,
            DaemonKind::TrogdorAgent => TROGDOR_AGENT_START,
            DaemonKind::TrogdorCoordinator => TROGDOR_COORDINATOR_START,
            DaemonKind::JmxDumper => JMX_START,
        }
    }

    pub fn status_type(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZOOKEEPER_STATUS,
            DaemonKind::Broker => BROKER_STATUS,
            DaemonKind::TrogdorAgent => TROGDOR_AGENT_STATUS,
            DaemonKind::TrogdorCoordinator => TROGDOR_COORDINATOR_STATUS,
            DaemonKind::JmxDumper => JMX_STATUS,
        }
    }

    pub fn stop_type(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZOOKEEPER_STOP,
            DaemonKind::Broker => BROKER_STOP,
            DaemonKind::TrogdorAgent => TROGDOR_AGENT_STOP,
            DaemonKind::TrogdorCoordinator => TROGDOR_COORDINATOR_STOP,
            DaemonKind::JmxDumper => JMX_STOP,
        }
    }

    /// The main class, as `jcmd` and `ps` report it.
    pub fn class_name(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => "org.apache.zookeeper.server.quorum.QuorumPeerMain",
            DaemonKind::Broker => "kafka.Kafka",
            DaemonKind::TrogdorAgent => "org.apache.kafka.trogdor.agent.Agent",
            DaemonKind::TrogdorCoordinator => "org.apache.kafka.trogdor.coordinator.Coordinator",
            DaemonKind::JmxDumper => "io.confluent.castle.jmx.JmxDumper",
        }
    }

    fn label(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => "zookeeper",
            DaemonKind::Broker => "broker",
            DaemonKind::TrogdorAgent => "agent",
            DaemonKind::TrogdorCoordinator => "coordinator",
            DaemonKind::JmxDumper => "jmx-dumper",
        }
    }

    fn root(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZK_ROOT,
            DaemonKind::Broker => KAFKA_ROOT,
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => TROGDOR_ROOT,
            DaemonKind::JmxDumper => JMX_DUMPER_ROOT,
        }
    }

    fn conf_dir(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZK_CONF,
            DaemonKind::Broker => KAFKA_CONF,
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => TROGDOR_CONF,
            DaemonKind::JmxDumper => JMX_DUMPER_CONF,
        }
    }

    fn logs_dir(self) -> &'static str {
        match self {
            DaemonKind::ZooKeeper => ZK_LOGS,
            DaemonKind::Broker => KAFKA_LOGS,
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => TROGDOR_LOGS,
            DaemonKind::JmxDumper => JMX_DUMPER_LOGS,
        }
    }

    fn data_dir(self) -> Option<&'static str> {
        match self {
            DaemonKind::ZooKeeper => Some(ZK_DATA),
            DaemonKind::Broker => Some(KAFKA_DATA),
            DaemonKind::TrogdorAgent
            | DaemonKind::TrogdorCoordinator
            | DaemonKind::JmxDumper => None,
        }
    }

    fn conf_file(self) -> String {
        let name = match self {
            DaemonKind::ZooKeeper => "zookeeper.properties",
            DaemonKind::Broker => "server.properties",
            DaemonKind::TrogdorAgent => "agent.conf",
            DaemonKind::TrogdorCoordinator => "coordinator.conf",
            DaemonKind::JmxDumper => "jmx-dumper.conf",
        };
        format!("{}/{name}", self.conf_dir())
    }

    /// Cross-node dependencies of the start action. Daemons come up in the
    /// order zookeeper, brokers, agents, coordinator.
    fn start_targets(self) -> Vec<TargetId> {
        match self {
            DaemonKind::ZooKeeper => vec![],
            DaemonKind::Broker => vec![TargetId::all(ZOOKEEPER_START)],
            // The trogdor config names every trogdor node, so they all need
            // their addresses first.
            DaemonKind::TrogdorAgent => {
                vec![TargetId::all(BROKER_START), TargetId::all(INIT)]
            }
            DaemonKind::TrogdorCoordinator => {
                vec![TargetId::all(TROGDOR_AGENT_START), TargetId::all(INIT)]
            }
            // The dumper connects to the brokers' JMX ports.
            DaemonKind::JmxDumper => vec![TargetId::all(BROKER_START)],
        }
    }

    /// Cross-node dependencies of the stop action; the reverse of startup.
    fn stop_targets(self) -> Vec<TargetId> {
        match self {
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => {
                vec![TargetId::all(TASK_STOP)]
            }
            DaemonKind::Broker => vec![
                TargetId::all(TROGDOR_AGENT_STOP),
                TargetId::all(TROGDOR_COORDINATOR_STOP),
                TargetId::all(JMX_STOP),
            ],
            DaemonKind::ZooKeeper => vec![TargetId::all(BROKER_STOP)],
            DaemonKind::JmxDumper => vec![],
        }
    }

    /// Render the daemon's configuration file for `node`.
    pub fn render_config(
        self,
        cluster: &CastleCluster,
        node: &CastleNode,
    ) -> anyhow::Result<String> {
        match self {
            DaemonKind::ZooKeeper => {
                let conf = match node.role(RoleKind::ZooKeeper) {
                    Some(Role::ZooKeeper(r)) => r.conf,
                    _ => BTreeMap::new(),
                };
                let defaults = BTreeMap::from([
                    ("dataDir".to_string(), ZK_DATA.to_string()),
                    ("clientPort".to_string(), ZOOKEEPER_PORT.to_string()),
                    ("maxClientCnxns".to_string(), "0".to_string()),
                ]);
                Ok(render_properties(&merge_config(&conf, &defaults)))
            }
            DaemonKind::Broker => {
                let conf = match node.role(RoleKind::Broker) {
                    Some(Role::Broker(r)) => r.conf,
                    _ => BTreeMap::new(),
                };
                let defaults = BTreeMap::from([
                    ("broker.id".to_string(), node.index().to_string()),
                    ("listeners".to_string(), format!("PLAINTEXT://:{BROKER_PORT}")),
                    (
                        "advertised.listeners".to_string(),
                        format!(
                            "PLAINTEXT://{}:{BROKER_PORT}",
                            node.uplink().internal_dns(node)
                        ),
                    ),
                    ("log.dirs".to_string(), KAFKA_DATA.to_string()),
                    ("zookeeper.connect".to_string(), cluster.zookeeper_connect()),
                ]);
                Ok(render_properties(&merge_config(&conf, &defaults)))
            }
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => {
                let conf = trogdor_config(cluster);
                Ok(serde_json::to_string_pretty(&conf)?)
            }
            DaemonKind::JmxDumper => {
                let conf = match node.role(RoleKind::JmxDumper) {
                    Some(Role::JmxDumper(r)) => r.conf,
                    _ => Map::new(),
                };
                Ok(serde_json::to_string_pretty(&Value::Object(conf))?)
            }
        }
    }

    /// Remote shell arguments which launch the daemon in the background.
    fn run_args(self, node: &CastleNode) -> Vec<String> {
        let conf = self.conf_file();
        let mut args: Vec<String> = vec!["-n".into(), "--".into(), "nohup".into(), "env".into()];
        args.push(format!("LOG_DIR={}", self.logs_dir()));
        match self {
            DaemonKind::ZooKeeper => {
                args.push(format!("{KAFKA_SRC}/bin/zookeeper-server-start.sh"));
                args.push(conf);
            }
            DaemonKind::Broker => {
                if let Some(Role::Broker(r)) = node.role(RoleKind::Broker) {
                    if !r.jvm_options.is_empty() {
                        args.push(format!("KAFKA_OPTS='{}'", r.jvm_options));
                    }
                }
                args.push(format!("{KAFKA_SRC}/bin/kafka-server-start.sh"));
                args.push(conf);
            }
            DaemonKind::TrogdorAgent | DaemonKind::TrogdorCoordinator => {
                args.push(format!("{KAFKA_SRC}/bin/trogdor.sh"));
                args.push(self.label().to_string());
                args.push("-c".into());
                args.push(conf);
                args.push("-n".into());
                args.push(node.name().to_string());
            }
            DaemonKind::JmxDumper => {
                args.push(JMX_DUMPER_START_SCRIPT.to_string());
                args.push(conf);
            }
        }
        args.push(format!(
            "&>{}/{}-stdout-stderr.txt",
            self.logs_dir(),
            self.label()
        ));
        args.push("</dev/null".into());
        args.push("&".into());
        args
    }

    /// Files the role wants on the node next to the daemon's config.
    fn additional_files(self, node: &CastleNode) -> Vec<AdditionalFile> {
        match (self, node.role(self.role_kind())) {
            (DaemonKind::Broker, Some(Role::Broker(r))) => r.additional_files,
            _ => Vec::new(),
        }
    }

    /// Remote shell arguments which recreate the daemon's directories.
    fn setup_args(self) -> Vec<String> {
        let mut dirs = vec![self.conf_dir(), self.logs_dir()];
        dirs.extend(self.data_dir());
        let mut args = vec!["-n", "--", "sudo", "rm", "-rf", self.root(), self.logs_dir()];
        args.extend(["&&", "sudo", "mkdir", "-p"]);
        args.extend(dirs);
        args.extend(["&&", "sudo", "chown", "-R", "`whoami`", self.root(), self.logs_dir()]);
        args.into_iter().map(str::to_string).collect()
    }
}

fn render_properties(conf: &BTreeMap<String, String>) -> String {
    conf.iter().map(|(k, v)| format!("{k}={v}\n")).collect()
}

/// The trogdor platform config shared by every agent and coordinator.
fn trogdor_config(cluster: &CastleCluster) -> Value {
    let mut nodes = Map::new();
    for node in cluster.nodes().values() {
        let agent = node.has_role(RoleKind::TrogdorAgent);
        let coordinator = node.has_role(RoleKind::TrogdorCoordinator);
        if !agent && !coordinator {
            continue;
        }
        let mut entry = Map::new();
        entry.insert("hostname".into(), json!(node.uplink().internal_dns(node)));
        if agent {
            entry.insert("trogdor.agent.port".into(), json!(TROGDOR_AGENT_PORT));
        }
        if coordinator {
            entry.insert(
                "trogdor.coordinator.port".into(),
                json!(TROGDOR_COORDINATOR_PORT),
            );
        }
        nodes.insert(node.name().to_string(), Value::Object(entry));
    }
    json!({
        "platform": "org.apache.kafka.trogdor.basic.BasicPlatform",
        "nodes": nodes,
    })
}

/// True if a process matching the daemon's class is running on the node.
fn is_running(kind: DaemonKind, node: &CastleNode) -> anyhow::Result<bool> {
    let out = node
        .uplink()
        .command(node)
        .args(process_pid_args(kind.class_name()))
        .log_output_on_success(false)
        .must_run()?;
    Ok(!out.trim().is_empty())
}

pub fn create_actions(
    kind: DaemonKind,
    scope: &str,
    initial_delay_ms: u64,
) -> Vec<Arc<dyn Action>> {
    vec![
        Arc::new(StartDaemon {
            meta: ActionMeta::new(
                ActionId::new(kind.start_type(), scope),
                kind.start_targets(),
                &[SETUP],
                initial_delay_ms,
            ),
            kind,
        }),
        Arc::new(CheckDaemon {
            meta: ActionMeta::new(ActionId::new(kind.status_type(), scope), vec![], &[], 0),
            kind,
        }),
        Arc::new(StopDaemon {
            meta: ActionMeta::new(
                ActionId::new(kind.stop_type(), scope),
                kind.stop_targets(),
                &[],
                initial_delay_ms,
            ),
            kind,
        }),
    ]
}

struct StartDaemon {
    meta: ActionMeta,
    kind: DaemonKind,
}

impl Action for StartDaemon {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let kind = self.kind;
        let rendered = kind.render_config(cluster, node)?;
        let mut local = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", node.name(), kind.label()))
            .tempfile_in(cluster.env().working_directory())
            .context("unable to create a local config file")?;
        local.write_all(rendered.as_bytes())?;
        local.flush()?;

        let uplink = node.uplink();
        uplink
            .command(node)
            .args(kill_process_args(kind.class_name(), "SIGKILL"))
            .must_run()?;
        uplink.command(node).args(kind.setup_args()).must_run()?;
        uplink
            .command(node)
            .sync_to(local.path().to_string_lossy(), kind.conf_file())
            .must_run()?;
        for file in kind.additional_files(node) {
            uplink
                .command(node)
                .sync_to(file.local, file.remote)
                .must_run()?;
        }
        uplink.command(node).args(kind.run_args(node)).must_run()?;

        wait_for(PID_POLL, START_MAX_WAIT, kind.class_name(), || {
            is_running(kind, node)
        })?;
        node.log()
            .info(&format!("*** {}: started {}.", node.name(), kind.label()));
        Ok(())
    }
}

struct CheckDaemon {
    meta: ActionMeta,
    kind: DaemonKind,
}

impl Action for CheckDaemon {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let manager = cluster.shutdown_manager();
        let class = self.kind.class_name();
        if !node.uplink().can_login(node) {
            node.log().warn(&format!(
                "{}: {class} is not running because we cannot log in.",
                node.name()
            ));
            manager.change_return_code(CastleReturnCode::ClusterFailed);
            return Ok(());
        }
        let out = node
            .uplink()
            .command(node)
            .args(["-n", "--", "jcmd", "|", "grep", class])
            .run()?;
        let code = match out.status {
            0 => {
                let pid = out.output.split_whitespace().next().unwrap_or("");
                node.log()
                    .info(&format!("{}: {class} is running as pid {pid}", node.name()));
                CastleReturnCode::Success
            }
            1 => {
                node.log()
                    .warn(&format!("{}: {class} is not running.", node.name()));
                CastleReturnCode::ClusterFailed
            }
            status => {
                node.log().warn(&format!(
                    "{}: unable to determine if {class} is running (exit {status}).",
                    node.name()
                ));
                CastleReturnCode::ToolFailed
            }
        };
        manager.change_return_code(code);
        Ok(())
    }
}

struct StopDaemon {
    meta: ActionMeta,
    kind: DaemonKind,
}

impl Action for StopDaemon {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let kind = self.kind;
        if !node.uplink().can_login(node) {
            node.log().info(&format!(
                "*** Skipping {}, because we can't log into the node.",
                kind.stop_type()
            ));
            return Ok(());
        }
        node.uplink()
            .command(node)
            .args(kill_process_args(kind.class_name(), "SIGTERM"))
            .must_run()?;
        let stopped = wait_for(PID_POLL, STOP_GRACE, kind.class_name(), || {
            Ok(!is_running(kind, node)?)
        });
        if stopped.is_err() {
            node.log().warn(&format!(
                "*** {} did not exit after SIGTERM; sending SIGKILL.",
                kind.class_name()
            ));
            node.uplink()
                .command(node)
                .args(kill_process_args(kind.class_name(), "SIGKILL"))
                .must_run()?;
        }
        Ok(())
    }
}
