use std::sync::Arc;

use anyhow::Context;

use super::Uplink;
use crate::cloud::docker::DockerCloud;
use crate::cloud::CloudFuture;
use crate::cluster::{CastleCluster, CastleNode};
use crate::command::{RemoteCommand, SshTarget};
use crate::env::CastleEnvironment;
use crate::role::DockerNodeRole;

/// Reaches a docker container through the ssh port it publishes on localhost.
pub struct DockerUplink {
    cloud: Arc<DockerCloud>,
    env: CastleEnvironment,
}

impl DockerUplink {
    pub fn new(cloud: Arc<DockerCloud>, env: CastleEnvironment) -> Self {
        Self { cloud, env }
    }

    pub fn cloud(&self) -> &Arc<DockerCloud> {
        &self.cloud
    }

    fn role(node: &CastleNode) -> DockerNodeRole {
        node.docker_role().unwrap_or_default()
    }
}

pub(crate) fn container_name_for(node: &CastleNode) -> String {
    format!("ducker{:02}", node.index())
}

impl Uplink for DockerUplink {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn command<'a>(&self, node: &'a CastleNode) -> RemoteCommand<'a> {
        let role = Self::role(node);
        RemoteCommand::new(
            node,
            SshTarget {
                dns: "localhost".to_string(),
                user: role.docker_user,
                port: role.ssh_port,
                identity_file: role.ssh_identity_path,
            },
        )
    }

    fn internal_dns(&self, node: &CastleNode) -> String {
        Self::role(node).container_name
    }

    fn started(&self, node: &CastleNode) -> bool {
        !Self::role(node).container_name.is_empty()
    }

    fn can_login(&self, node: &CastleNode) -> bool {
        let role = Self::role(node);
        role.ssh_port > 0 && !role.container_name.is_empty()
    }

    fn startup(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let role = Self::role(node);
        let name = node.name();
        if !role.container_name.is_empty() {
            anyhow::bail!("Can't start node {name} because there is already a container name set.");
        }
        if role.ssh_port > 0 {
            anyhow::bail!("Can't start node {name} because there is already an ssh port set.");
        }
        if !role.ssh_identity_path.is_empty() {
            anyhow::bail!(
                "Can't start node {name} because there is already an ssh identity path set."
            );
        }
        let container = container_name_for(node);
        node.log().info(&format!(
            "*** Creating new docker container {container} with image ID {}",
            role.image_id
        ));
        let id = self
            .cloud
            .startup(cluster, node, &role, &container)
            .with_context(|| format!("unable to start container {container}"))?;
        node.log()
            .info(&format!("*** Created a new docker container {id}"));
        // Record the container first so a failure below still lets it be destroyed.
        node.update_docker_role(|r| r.container_name = container.clone());
        let port = self.cloud.docker_port(node, &container)?;
        let key = self
            .cloud
            .save_ssh_key_file(&self.env, node, &container, &role.docker_user)?;
        node.update_docker_role(|r| {
            r.ssh_port = port;
            r.ssh_identity_path = key.to_string_lossy().into_owned();
        });
        Ok(())
    }

    fn check(&self, node: &CastleNode) -> anyhow::Result<()> {
        let containers = self.cloud.list_containers(node)?;
        node.log().debug(&format!(
            "*** Found container name(s): {}",
            containers.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
        let role = Self::role(node);
        let name = node.name();
        if role.container_name.is_empty() {
            node.log()
                .info(&format!("*** {name}: No docker container name."));
        } else if containers.contains(&role.container_name) {
            node.log().info(&format!(
                "*** {name}: Found container name {}.",
                role.container_name
            ));
        } else {
            node.log().warn(&format!(
                "*** {name}: Failed to find container name {}.",
                role.container_name
            ));
        }
        Ok(())
    }

    fn shutdown(&self, node: &CastleNode) -> anyhow::Result<CloudFuture<()>> {
        let container = Self::role(node).container_name;
        if !container.is_empty() {
            self.cloud.shutdown(node, &container)?;
            node.update_docker_role(|r| r.container_name.clear());
        }
        Ok(CloudFuture::ready(()))
    }

    fn shutdown_all(&self, node: &CastleNode) -> anyhow::Result<()> {
        self.cloud.shutdown_all(node)?;
        Ok(())
    }
}
