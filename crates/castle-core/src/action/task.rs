//! Trogdor task actions: submit, report on and stop the task specs of a
//! `task` role.
//!
//! The coordinator's REST endpoint is only reachable from the coordinator's
//! own node, so requests are `curl` invocations run over the node's uplink.
//! A task role therefore belongs on the node that runs the coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::daemon::{DaemonKind, TROGDOR_COORDINATOR_PORT};
use super::types::{DAEMON_START, DAEMON_STATUS, TASK_START, TASK_STATUS, TASK_STOP};
use super::{Action, ActionId, ActionMeta, TargetId};
use crate::cluster::{CastleCluster, CastleNode};
use crate::error::CastleError;
use crate::json_transform::{map_substituter, transform};
use crate::return_code::CastleReturnCode;
use crate::role::TaskRole;
use crate::util::wait_for;

const DONE: &str = "DONE";
/// curl's exit code when it cannot connect.
const CURL_COULDNT_CONNECT: i32 = 7;

const STOP_POLL: Duration = Duration::from_millis(5);
const STOP_MAX_WAIT: Duration = Duration::from_secs(30);

/// Talks to the trogdor coordinator running on `node`.
pub struct TrogdorClient<'a> {
    node: &'a CastleNode,
}

impl<'a> TrogdorClient<'a> {
    pub fn new(node: &'a CastleNode) -> Self {
        Self { node }
    }

    fn curl(&self, endpoint: &str, method: &str, input: Option<&Value>) -> anyhow::Result<Value> {
        let url = format!("http://localhost:{TROGDOR_COORDINATOR_PORT}/coordinator/{endpoint}");
        let mut args = vec![
            "curl",
            "-H",
            "Content-Type:application/json",
            "-w",
            "_%{http_code}",
            "-X",
            method,
            url.as_str(),
        ];
        if input.is_some() {
            args.extend(["-d", "@-"]);
        }
        let mut command = self.node.uplink().command(self.node).args(args);
        if let Some(input) = input {
            command = command.stdin(serde_json::to_vec(input)?);
        }
        let output = command.must_run()?;
        let (status, body) = split_http_status(&output)?;
        if status != 200 {
            anyhow::bail!(
                "{}: got HTTP error {status} from {method} {endpoint}",
                self.node.name()
            );
        }
        serde_json::from_str(body).map_err(|e| {
            anyhow::anyhow!(
                "{}: unable to parse the response {body:?} from {endpoint}: {e}",
                self.node.name()
            )
        })
    }

    pub fn create_task(&self, id: &str, spec: &Value) -> anyhow::Result<()> {
        self.curl("task/create", "POST", Some(&json!({"id": id, "spec": spec})))?;
        Ok(())
    }

    /// Every task the coordinator knows about, keyed by id.
    pub fn tasks(&self) -> anyhow::Result<BTreeMap<String, Value>> {
        let result = self.curl("tasks", "GET", None)?;
        Ok(match result.get("tasks") {
            Some(Value::Object(tasks)) => tasks.clone().into_iter().collect(),
            _ => BTreeMap::new(),
        })
    }

    pub fn stop_task(&self, id: &str) -> anyhow::Result<()> {
        self.curl("task/stop", "PUT", Some(&json!({"id": id})))?;
        Ok(())
    }
}

/// Split curl output produced with `-w _%{http_code}` into the status code
/// and the response body.
fn split_http_status(output: &str) -> anyhow::Result<(u16, &str)> {
    let output = output.trim();
    let Some((body, code)) = output.rsplit_once('_') else {
        anyhow::bail!("HTTP status not found on stdout for curl command.");
    };
    let code = code
        .parse()
        .map_err(|_| anyhow::anyhow!("unable to parse HTTP status code {code:?}"))?;
    Ok((code, body))
}

fn curl_exit_code(err: &anyhow::Error) -> Option<i32> {
    err.downcast_ref::<CastleError>()
        .and_then(CastleError::command_exit_code)
}

pub fn create_actions(scope: &str, role: &TaskRole) -> Vec<Arc<dyn Action>> {
    let specs = Arc::new(role.task_specs.clone());
    vec![
        Arc::new(TaskStart {
            meta: ActionMeta::new(
                ActionId::new(TASK_START, scope),
                vec![
                    TargetId::all(DAEMON_START),
                    TargetId::all(DaemonKind::TrogdorCoordinator.start_type()),
                ],
                &[],
                role.initial_delay_ms,
            ),
            specs: Arc::clone(&specs),
        }),
        Arc::new(TaskStatus {
            meta: ActionMeta::new(
                ActionId::new(TASK_STATUS, scope),
                vec![TargetId::all(DAEMON_STATUS)],
                &[],
                0,
            ),
            specs: Arc::clone(&specs),
        }),
        Arc::new(TaskStop {
            meta: ActionMeta::new(
                ActionId::new(TASK_STOP, scope),
                vec![],
                &[],
                role.initial_delay_ms,
            ),
            specs,
        }),
    ]
}

/// Apply `%{bootstrapServers}` substitution to every task spec.
fn transformed_specs(
    cluster: &CastleCluster,
    specs: &BTreeMap<String, Value>,
) -> anyhow::Result<BTreeMap<String, Value>> {
    let values = BTreeMap::from([("bootstrapServers".to_string(), cluster.bootstrap_servers())]);
    let mut substitute = map_substituter(&values);
    specs
        .iter()
        .map(|(id, spec)| Ok((id.clone(), transform(spec, &mut substitute)?)))
        .collect()
}

struct TaskStart {
    meta: ActionMeta,
    specs: Arc<BTreeMap<String, Value>>,
}

impl Action for TaskStart {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let client = TrogdorClient::new(node);
        for (id, spec) in transformed_specs(cluster, &self.specs)? {
            client.create_task(&id, &spec)?;
            node.log().info(&format!("*** Created task {id}"));
        }
        Ok(())
    }
}

struct TaskStatus {
    meta: ActionMeta,
    specs: Arc<BTreeMap<String, Value>>,
}

impl TaskStatus {
    /// The return code one task's coordinator state maps to.
    fn task_code(node: &CastleNode, id: &str, state: Option<&Value>) -> CastleReturnCode {
        let name = node.name();
        let Some(state) = state else {
            node.log().warn(&format!("** {name}: Unable to find task {id}"));
            return CastleReturnCode::ClusterFailed;
        };
        let Some(phase) = state.get("state").and_then(Value::as_str) else {
            node.log()
                .warn(&format!("** {name}: Unable to find 'state' field for task {id}"));
            return CastleReturnCode::ClusterFailed;
        };
        let status = state.get("status").cloned().unwrap_or(Value::Null);
        if phase != DONE {
            node.log().info(&format!(
                "** {name}: Task {id} is in progress with status {status}"
            ));
            return CastleReturnCode::InProgress;
        }
        let error = state
            .get("error")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");
        if error.is_empty() {
            node.log().info(&format!(
                "** {name}: Task {id} succeeded with status {status}"
            ));
            CastleReturnCode::Success
        } else {
            node.log()
                .warn(&format!("** {name}: Task {id} failed with error '{error}'"));
            CastleReturnCode::ClusterFailed
        }
    }
}

impl Action for TaskStatus {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let manager = cluster.shutdown_manager();
        if !node.uplink().can_login(node) {
            node.log().warn(&format!(
                "{}: can't check task status because we cannot log in.",
                node.name()
            ));
            manager.change_return_code(CastleReturnCode::ClusterFailed);
            return Ok(());
        }
        let tasks = match TrogdorClient::new(node).tasks() {
            Ok(tasks) => tasks,
            Err(e) if curl_exit_code(&e) == Some(CURL_COULDNT_CONNECT) => {
                node.log().warn(&format!(
                    "** {}: Failed to connect to the Trogdor coordinator.",
                    node.name()
                ));
                manager.change_return_code(CastleReturnCode::ClusterFailed);
                return Ok(());
            }
            Err(e) if curl_exit_code(&e).is_some() => return Err(e),
            Err(e) => {
                node.log()
                    .warn(&format!("Error getting trogdor tasks status: {e:#}"));
                manager.change_return_code(CastleReturnCode::ToolFailed);
                return Ok(());
            }
        };
        for id in self.specs.keys() {
            manager.change_return_code(Self::task_code(node, id, tasks.get(id)));
        }
        Ok(())
    }
}

struct TaskStop {
    meta: ActionMeta,
    specs: Arc<BTreeMap<String, Value>>,
}

impl TaskStop {
    fn stop_all(&self, node: &CastleNode) -> anyhow::Result<()> {
        let client = TrogdorClient::new(node);
        for id in self.specs.keys() {
            client.stop_task(id)?;
        }
        wait_for(STOP_POLL, STOP_MAX_WAIT, "trogdor tasks to stop", || {
            let tasks = client.tasks()?;
            Ok(self.specs.keys().all(|id| {
                match tasks.get(id).and_then(|t| t.get("state")).and_then(Value::as_str) {
                    Some(state) => state == DONE,
                    None => true,
                }
            }))
        })
    }
}

impl Action for TaskStop {
    fn meta(&self) -> &ActionMeta {
        &self.meta
    }

    fn call(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        if !node.uplink().started(node) {
            node.log().info(&format!(
                "*** Skipping {TASK_STOP}, because the node is not running."
            ));
            return Ok(());
        }
        let class = DaemonKind::TrogdorCoordinator.class_name();
        let probe = node
            .uplink()
            .command(node)
            .args(["-n", "--", "jcmd", "|", "grep", "-q", class])
            .run()?;
        if !probe.success() {
            node.log().info(&format!(
                "*** Ignoring {TASK_STOP} because the Trogdor coordinator process does not appear to be running."
            ));
            return Ok(());
        }
        if let Err(e) = self.stop_all(node) {
            node.log()
                .warn(&format!("Error stopping trogdor tasks: {e:#}"));
            cluster
                .shutdown_manager()
                .change_return_code(CastleReturnCode::ToolFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_cluster;

    fn specs() -> BTreeMap<String, Value> {
        BTreeMap::from([
            (
                "produce".to_string(),
                json!({"class": "ProduceBenchSpec", "bootstrapServers": "%{bootstrapServers}"}),
            ),
            ("consume".to_string(), json!({"class": "ConsumeBenchSpec"})),
        ])
    }

    #[test]
    fn splits_status_from_body() {
        let (code, body) = split_http_status("{\"tasks\":{}}_200\n").unwrap();
        assert_eq!(code, 200);
        assert_eq!(body, "{\"tasks\":{}}");
        assert_eq!(split_http_status("_404").unwrap(), (404, ""));
        assert!(split_http_status("no status here").is_err());
        assert!(split_http_status("body_abc").is_err());
    }

    #[test]
    fn wires_task_actions_after_daemons() {
        let role = TaskRole {
            initial_delay_ms: 250,
            task_specs: specs(),
        };
        let actions = create_actions("node3", &role);
        assert_eq!(actions[0].id().to_string(), "taskStart:node3");
        assert!(actions[0].targets().contains(&TargetId::all("daemonStart")));
        assert!(actions[0]
            .targets()
            .contains(&TargetId::all("trogdorCoordinatorStart")));
        assert_eq!(actions[0].initial_delay(), Duration::from_millis(250));
        assert_eq!(actions[1].targets(), &[TargetId::all("daemonStatus")]);
        assert!(actions[2].targets().is_empty());
    }

    #[test]
    fn specs_get_bootstrap_servers() {
        let (_dir, cluster) = test_cluster();
        for node in cluster.nodes().values() {
            let name = format!("ducker{:02}", node.index());
            node.update_docker_role(|r| r.container_name = name);
        }
        let out = transformed_specs(&cluster, &specs()).unwrap();
        assert_eq!(
            out["produce"]["bootstrapServers"],
            "ducker00:9092,ducker01:9092,ducker02:9092"
        );
        assert_eq!(out["consume"], json!({"class": "ConsumeBenchSpec"}));
    }

    #[test]
    fn task_states_map_to_return_codes() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node3").unwrap();
        let code = |state: Option<Value>| TaskStatus::task_code(node, "t", state.as_ref());
        assert_eq!(code(None), CastleReturnCode::ClusterFailed);
        assert_eq!(code(Some(json!({}))), CastleReturnCode::ClusterFailed);
        assert_eq!(
            code(Some(json!({"state": "RUNNING", "status": {"sent": 10}}))),
            CastleReturnCode::InProgress
        );
        assert_eq!(
            code(Some(json!({"state": "DONE", "status": {}}))),
            CastleReturnCode::Success
        );
        assert_eq!(
            code(Some(json!({"state": "DONE", "error": "boom"}))),
            CastleReturnCode::ClusterFailed
        );
    }

    #[test]
    fn status_without_login_is_a_cluster_failure() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node3").unwrap();
        let role = TaskRole {
            initial_delay_ms: 0,
            task_specs: specs(),
        };
        create_actions("node3", &role)[1].call(&cluster, node).unwrap();
        assert_eq!(
            cluster.shutdown_manager().return_code(),
            CastleReturnCode::ClusterFailed
        );
    }

    #[test]
    fn stop_skips_nodes_that_are_not_running() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node3").unwrap();
        let role = TaskRole::default();
        create_actions("node3", &role)[2].call(&cluster, node).unwrap();
        assert_eq!(
            cluster.shutdown_manager().return_code(),
            CastleReturnCode::Success
        );
    }
}
