//! Local docker containers on a private bridge network.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use super::Cloud;
use crate::action::paths::{CASTLE_SRC, KAFKA_SRC, LOGS_ROOT};
use crate::cluster::{CastleCluster, CastleNode};
use crate::command::NodeShellRunner;
use crate::env::CastleEnvironment;
use crate::error::{CastleError, Result};
use crate::io::write_private;
use crate::role::DockerNodeRole;

pub const DOCKER_CLOUD_KEY: &str = "DockerCloud{}";
pub const DOCKER_NETWORK: &str = "ducknet";

#[derive(Default)]
pub struct DockerCloud {
    /// Outcome of ensuring the network exists; computed once per cloud.
    network_check: OnceLock<std::result::Result<(), String>>,
    shutdown_all_invoked: AtomicBool,
}

impl Cloud for DockerCloud {
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn docker() -> Result<String> {
    let path = which::which("docker")
        .map_err(|e| CastleError::Cloud(format!("unable to find docker: {e}")))?;
    Ok(path.to_string_lossy().into_owned())
}

fn docker_args<I, S>(rest: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut args = vec![docker()?];
    args.extend(rest.into_iter().map(Into::into));
    Ok(args)
}

impl DockerCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the bridge network exists. Every caller waits for the first
    /// check and shares its result.
    pub fn ensure_network(&self, node: &CastleNode) -> Result<()> {
        self.network_check
            .get_or_init(|| create_network(node).map_err(|e| e.to_string()))
            .clone()
            .map_err(CastleError::Cloud)
    }

    /// Start a container for `node`; returns the container id.
    pub fn startup(
        &self,
        cluster: &CastleCluster,
        node: &CastleNode,
        role: &DockerNodeRole,
        container_name: &str,
    ) -> Result<String> {
        self.ensure_network(node)?;
        let logs_dir = cluster.env().node_logs_dir(node.name());
        std::fs::create_dir_all(&logs_dir)?;
        let args = docker_args(run_args(
            role,
            container_name,
            &cluster.conf().castle_path,
            &cluster.conf().kafka_path,
            &logs_dir.to_string_lossy(),
        ))?;
        let out = NodeShellRunner::new(node, args).must_run()?;
        Ok(out.trim().to_string())
    }

    /// The host port published for the container's ssh daemon.
    pub fn docker_port(&self, node: &CastleNode, container_name: &str) -> Result<u16> {
        let args = docker_args(["port", container_name, "22"])?;
        let out = NodeShellRunner::new(node, args).must_run()?;
        parse_docker_port(&out).ok_or_else(|| {
            CastleError::Cloud(format!(
                "unable to parse the ssh port of {container_name} from {:?}",
                out.trim()
            ))
        })
    }

    /// Copy the container user's private key to `<wd>/<container>.id_rsa`.
    pub fn save_ssh_key_file(
        &self,
        env: &CastleEnvironment,
        node: &CastleNode,
        container_name: &str,
        docker_user: &str,
    ) -> Result<PathBuf> {
        self.ensure_network(node)?;
        let mut rest = vec!["exec".to_string()];
        if !docker_user.is_empty() {
            rest.push("--user".to_string());
            rest.push(docker_user.to_string());
        }
        rest.extend(
            [container_name, "bash", "-c", "cat ~/.ssh/id_rsa"]
                .iter()
                .map(|s| s.to_string()),
        );
        // Keep key material out of the node log.
        let out = NodeShellRunner::new(node, docker_args(rest)?)
            .log_output_on_success(false)
            .run()?;
        if !out.success() {
            return Err(CastleError::Cloud(format!(
                "Failed to get the ssh key file for {container_name}"
            )));
        }
        let path = env
            .working_directory()
            .join(format!("{container_name}.id_rsa"));
        write_private(&path, out.output.as_bytes())?;
        Ok(path)
    }

    pub fn list_containers(&self, node: &CastleNode) -> Result<BTreeSet<String>> {
        self.ensure_network(node)?;
        let args = docker_args([
            "ps",
            "-a",
            "--filter",
            format!("network={DOCKER_NETWORK}").as_str(),
            "--format",
            "{{.Names}}",
        ])?;
        let out = NodeShellRunner::new(node, args).must_run()?;
        Ok(parse_container_names(&out))
    }

    /// Kill and remove a container. Failures are logged; a container which is
    /// already gone is not an error.
    pub fn shutdown(&self, node: &CastleNode, container_name: &str) -> Result<()> {
        for verb in ["kill", "rm"] {
            let out = NodeShellRunner::new(node, docker_args([verb, container_name])?).run()?;
            if !out.success() {
                node.log().warn(&format!(
                    "*** docker {verb} {container_name} exited with {}",
                    out.status
                ));
            }
        }
        Ok(())
    }

    /// Remove every container on the network. Runs at most once per cloud.
    pub fn shutdown_all(&self, node: &CastleNode) -> Result<()> {
        if self.shutdown_all_invoked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let containers = self.list_containers(node)?;
        if containers.is_empty() {
            node.log()
                .info(&format!("*** {}: No docker containers found.", node.name()));
            return Ok(());
        }
        node.log().info(&format!(
            "*** {}: Removing docker container(s): {}",
            node.name(),
            containers.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
        for container in &containers {
            self.shutdown(node, container)?;
        }
        Ok(())
    }

    pub fn cleanup_network(&self, node: &CastleNode) -> Result<()> {
        let out = NodeShellRunner::new(node, docker_args(["network", "rm", DOCKER_NETWORK])?)
            .run()?;
        if out.success() {
            node.log()
                .info(&format!("*** removed docker network {DOCKER_NETWORK}"));
        } else {
            node.log().warn(&format!(
                "*** unable to remove docker network {DOCKER_NETWORK} (exit {})",
                out.status
            ));
        }
        Ok(())
    }
}

fn create_network(node: &CastleNode) -> Result<()> {
    let inspect = docker_args(["network", "inspect", DOCKER_NETWORK])?;
    if NodeShellRunner::new(node, inspect)
        .log_output_on_success(false)
        .run()?
        .success()
    {
        node.log().debug(&format!("** {DOCKER_NETWORK} is running."));
        return Ok(());
    }
    node.log().info(&format!("** starting {DOCKER_NETWORK}."));
    let create = docker_args(["network", "create", DOCKER_NETWORK])?;
    if NodeShellRunner::new(node, create).run()?.success() {
        node.log()
            .info(&format!("** successfully created {DOCKER_NETWORK}."));
        return Ok(());
    }
    Err(CastleError::Cloud(format!(
        "Failed to create {DOCKER_NETWORK}."
    )))
}

/// Arguments after `docker` for starting a node container.
fn run_args(
    role: &DockerNodeRole,
    container_name: &str,
    castle_path: &str,
    kafka_path: &str,
    logs_dir: &str,
) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--privileged",
        "--memory=3G",
        "--memory-swappiness=1",
        "--name",
        container_name,
        "-h",
        container_name,
        format!("--network={DOCKER_NETWORK}").as_str(),
        // Publish ssh on an ephemeral host port; `docker port` reports it.
        "-p",
        "22",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for (local, remote) in [
        (castle_path, CASTLE_SRC),
        (kafka_path, KAFKA_SRC),
        (logs_dir, LOGS_ROOT),
    ] {
        if !local.is_empty() {
            args.push("-v".to_string());
            args.push(format!("{local}:{remote}"));
        }
    }
    args.push("--".to_string());
    args.push(role.image_id.clone());
    args
}

/// Parse `docker port` output such as `0.0.0.0:32768` (one line per
/// address family).
fn parse_docker_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit(':').next())
        .find_map(|port| port.parse().ok())
}

fn parse_container_names(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('\'').trim_start_matches('/'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
