use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::is_zero;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
    /// Extra `server.properties` entries; these win over generated defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conf: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub jvm_options: String,
    /// Files copied onto the node before the broker starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<AdditionalFile>,
}

/// A local file and the path it is synced to on the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalFile {
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZooKeeperRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conf: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrogdorAgentRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrogdorCoordinatorRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
}

/// Periodically dumps JMX metrics from the brokers into the node's logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JmxDumperRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
    /// Passed through to the dumper as its JSON config file.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub conf: Map<String, Value>,
}

/// collectd runs from the node image; castle only flushes and stops it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectdRole {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub initial_delay_ms: u64,
}
