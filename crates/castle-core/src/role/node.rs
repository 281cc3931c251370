use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::UplinkRole;
use crate::cloud::docker::{DockerCloud, DOCKER_CLOUD_KEY};
use crate::cloud::ec2::{AwsCliApi, Ec2Cloud, Ec2Settings};
use crate::cloud::CloudCache;
use crate::env::CastleEnvironment;
use crate::error::Result;
use crate::uplink::docker::DockerUplink;
use crate::uplink::ec2::Ec2Uplink;
use crate::uplink::Uplink;

fn is_zero_port(v: &u16) -> bool {
    *v == 0
}

/// A node backed by a local docker container on the `ducknet` network.
///
/// `container_name`, `ssh_port` and `ssh_identity_path` are filled in when the
/// container starts and written back into the cluster file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerNodeRole {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_user: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_identity_path: String,
}

impl UplinkRole for DockerNodeRole {
    fn create_uplink(
        &self,
        clouds: &CloudCache,
        env: &CastleEnvironment,
    ) -> Result<Arc<dyn Uplink>> {
        let cloud = clouds.get_or_create(DOCKER_CLOUD_KEY, || Ok(DockerCloud::new()))?;
        Ok(Arc::new(DockerUplink::new(cloud, env.clone())))
    }
}

/// A node backed by an EC2 instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsNodeRole {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_pair: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub security_group: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_identity_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_dns: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_dns: String,
}

impl AwsNodeRole {
    /// The address used to reach the node from the controlling host.
    pub fn dns(&self) -> &str {
        &self.public_dns
    }

    pub fn settings(&self) -> Ec2Settings {
        Ec2Settings {
            key_pair: self.key_pair.clone(),
            security_group: self.security_group.clone(),
            region: self.region.clone(),
        }
    }
}

impl UplinkRole for AwsNodeRole {
    fn create_uplink(
        &self,
        clouds: &CloudCache,
        _env: &CastleEnvironment,
    ) -> Result<Arc<dyn Uplink>> {
        let settings = self.settings();
        let cloud = clouds.get_or_create(&settings.description(), || {
            let api = AwsCliApi::new(&settings.region);
            Ok(Ec2Cloud::start(settings.clone(), Box::new(api)))
        })?;
        Ok(Arc::new(Ec2Uplink::new(cloud)))
    }
}
