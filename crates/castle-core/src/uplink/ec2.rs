use std::sync::Arc;
use std::time::Duration;

use super::Uplink;
use crate::cloud::ec2::Ec2Cloud;
use crate::cloud::CloudFuture;
use crate::cluster::{CastleCluster, CastleNode};
use crate::command::{RemoteCommand, SshTarget};
use crate::role::AwsNodeRole;
use crate::util::wait_for;

const DNS_POLL_DELAY: Duration = Duration::from_millis(200);
const SSH_POLL_DELAY: Duration = Duration::from_millis(200);
const STARTUP_MAX_WAIT: Duration = Duration::from_secs(600);

/// Reaches an EC2 instance over ssh on its public address.
pub struct Ec2Uplink {
    cloud: Arc<Ec2Cloud>,
}

impl Ec2Uplink {
    pub fn new(cloud: Arc<Ec2Cloud>) -> Self {
        Self { cloud }
    }

    fn role(node: &CastleNode) -> AwsNodeRole {
        node.aws_role().unwrap_or_default()
    }

    /// Record the instance's addresses once EC2 has assigned both.
    fn check_dns(&self, node: &CastleNode, instance_id: &str) -> anyhow::Result<bool> {
        let info = self.cloud.describe_instance(instance_id).wait()?;
        if info.private_dns.is_empty() {
            node.log()
                .debug(&format!("*** Waiting for private DNS name for {instance_id}..."));
            return Ok(false);
        }
        if info.public_dns.is_empty() {
            node.log()
                .debug(&format!("*** Waiting for public DNS name for {instance_id}..."));
            return Ok(false);
        }
        node.log().info(&format!(
            "*** Got privateDnsName = {}, publicDnsName = {}",
            info.private_dns, info.public_dns
        ));
        node.update_aws_role(|r| {
            r.private_dns = info.private_dns;
            r.public_dns = info.public_dns;
        });
        Ok(true)
    }

    fn check_ssh(&self, node: &CastleNode) -> bool {
        match self.command(node).args(["-n", "--", "echo"]).must_run() {
            Ok(_) => {
                node.log().info(&format!(
                    "*** Successfully created an AWS node for {}",
                    node.name()
                ));
                true
            }
            Err(e) => {
                node.log()
                    .debug(&format!("*** Unable to ssh to {}: {e}", node.name()));
                false
            }
        }
    }
}

impl Uplink for Ec2Uplink {
    fn name(&self) -> &'static str {
        "ec2"
    }

    fn command<'a>(&self, node: &'a CastleNode) -> RemoteCommand<'a> {
        let role = Self::role(node);
        RemoteCommand::new(
            node,
            SshTarget {
                dns: role.dns().to_string(),
                user: role.ssh_user,
                port: role.ssh_port,
                identity_file: role.ssh_identity_file,
            },
        )
    }

    fn internal_dns(&self, node: &CastleNode) -> String {
        Self::role(node).private_dns
    }

    fn started(&self, node: &CastleNode) -> bool {
        !Self::role(node).instance_id.is_empty()
    }

    fn can_login(&self, node: &CastleNode) -> bool {
        !Self::role(node).dns().is_empty()
    }

    fn startup(&self, _cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()> {
        let role = Self::role(node);
        node.log().info(&format!(
            "*** Creating new instance with instance type {}, imageId {}",
            role.instance_type, role.image_id
        ));
        let instance_id = self
            .cloud
            .create_instance(&role.instance_type, &role.image_id)
            .wait()?;
        node.update_aws_role(|r| r.instance_id = instance_id.clone());

        wait_for(DNS_POLL_DELAY, STARTUP_MAX_WAIT, "instance DNS", || {
            self.check_dns(node, &instance_id)
        })?;
        wait_for(SSH_POLL_DELAY, STARTUP_MAX_WAIT, "instance ssh", || {
            Ok(self.check_ssh(node))
        })?;
        Ok(())
    }

    fn check(&self, node: &CastleNode) -> anyhow::Result<()> {
        let infos = self.cloud.describe_all_instances().wait()?;
        for info in &infos {
            node.log().debug(&format!("** Found {info:?}."));
        }
        let instance_id = Self::role(node).instance_id;
        let name = node.name();
        if instance_id.is_empty() {
            node.log()
                .info(&format!("*** {name}: No AWS instanceID configured."));
        } else if infos.iter().any(|i| i.instance_id == instance_id) {
            node.log()
                .info(&format!("*** {name}: Found instanceID {instance_id}."));
        } else {
            node.log()
                .warn(&format!("*** {name}: Failed to find instanceID {instance_id}."));
        }
        Ok(())
    }

    fn shutdown(&self, node: &CastleNode) -> anyhow::Result<CloudFuture<()>> {
        let instance_id = Self::role(node).instance_id;
        if instance_id.is_empty() {
            return Ok(CloudFuture::ready(()));
        }
        Ok(self.cloud.terminate_instance(&instance_id))
    }

    fn shutdown_all(&self, node: &CastleNode) -> anyhow::Result<()> {
        self.cloud.destroy_all(node)
    }
}
