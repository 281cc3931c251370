//! The declarative cluster file.
//!
//! ```json
//! {
//!   "conf":  { "kafkaPath": "...", "globalTimeout": 3600 },
//!   "nodes": { "node[0-2]": { "roleNames": ["broker", "docker"] } },
//!   "roles": { "broker": { "type": "broker" }, "docker": { "type": "dockerNode" } }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CastleError, Result};
use crate::json_merge;
use crate::json_transform::{castle_substituter, transform};
use crate::role::Role;

pub const DEFAULT_GLOBAL_TIMEOUT_SECS: u64 = 3600;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastleClusterConf {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kafka_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub castle_path: String,
    /// Seconds; zero or negative means the default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub global_timeout: i64,
}

impl CastleClusterConf {
    pub fn global_timeout(&self) -> Duration {
        if self.global_timeout <= 0 {
            Duration::from_secs(DEFAULT_GLOBAL_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.global_timeout as u64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastleNodeSpec {
    #[serde(default)]
    pub role_names: Vec<String>,
    /// Per-node JSON patches merged onto the named role.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_patches: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CastleClusterSpec {
    #[serde(default)]
    pub conf: CastleClusterConf,
    #[serde(default)]
    pub nodes: BTreeMap<String, CastleNodeSpec>,
    #[serde(default)]
    pub roles: BTreeMap<String, Value>,
}

impl CastleClusterSpec {
    /// Read a cluster file, substituting `%{CASTLE_*}` from the process
    /// environment.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CastleError::InvalidConf(format!(
                "unable to read cluster file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&text, |key| std::env::var(key).ok())
    }

    pub fn parse<L>(text: &str, lookup: L) -> Result<Self>
    where
        L: Fn(&str) -> Option<String>,
    {
        let raw: Value = serde_json::from_str(text)?;
        let substituted = transform(&raw, &mut castle_substituter(lookup))?;
        Ok(serde_json::from_value(substituted)?)
    }

    /// Resolve every node to its roles, in `roleNames` order, with patches
    /// applied. Node patterns are expanded.
    pub fn nodes_to_roles(&self) -> Result<BTreeMap<String, Vec<(String, Role)>>> {
        let mut out: BTreeMap<String, Vec<(String, Role)>> = BTreeMap::new();
        for (pattern, node_spec) in &self.nodes {
            for node_name in expand_node_pattern(pattern)? {
                if out.contains_key(&node_name) {
                    return Err(CastleError::NodeNameCollision(node_name));
                }
                let roles = self.resolve_roles(&node_name, node_spec)?;
                out.insert(node_name, roles);
            }
        }
        Ok(out)
    }

    fn resolve_roles(&self, node: &str, spec: &CastleNodeSpec) -> Result<Vec<(String, Role)>> {
        let mut kinds = BTreeSet::new();
        let mut roles = Vec::with_capacity(spec.role_names.len());
        for role_name in &spec.role_names {
            let base = self
                .roles
                .get(role_name)
                .ok_or_else(|| CastleError::UnknownRole {
                    node: node.to_string(),
                    role: role_name.clone(),
                })?;
            let merged = json_merge::merge(Some(base), spec.role_patches.get(role_name))
                .unwrap_or(Value::Null);
            let role: Role = serde_json::from_value(merged).map_err(|e| {
                CastleError::InvalidConf(format!("role {role_name} on node {node}: {e}"))
            })?;
            if !kinds.insert(role.kind()) {
                return Err(CastleError::DuplicateRole {
                    node: node.to_string(),
                    kind: role.kind().to_string(),
                });
            }
            roles.push((role_name.clone(), role));
        }
        Ok(roles)
    }
}

static RANGE_RE: OnceLock<Regex> = OnceLock::new();

/// Largest number of nodes a single pattern may expand to.
pub const MAX_PATTERN_NODES: u64 = 10_000;

fn range_re() -> &'static Regex {
    RANGE_RE.get_or_init(|| Regex::new(r"^([^\[\]]*)\[(\d+)-(\d+)\]([^\[\]]*)$").unwrap())
}

/// Expand a node key such as `node[0-2]` into `node0`, `node1`, `node2`.
///
/// At most one numeric range is allowed. A zero-padded lower bound
/// (`node[00-10]`) pads every expanded number to the same width. A range
/// may cover at most [`MAX_PATTERN_NODES`] nodes.
pub fn expand_node_pattern(pattern: &str) -> Result<Vec<String>> {
    if !pattern.contains('[') && !pattern.contains(']') {
        if pattern.is_empty() {
            return Err(CastleError::InvalidNodePattern(pattern.to_string()));
        }
        return Ok(vec![pattern.to_string()]);
    }
    let caps = range_re()
        .captures(pattern)
        .ok_or_else(|| CastleError::InvalidNodePattern(pattern.to_string()))?;
    let lo_text = &caps[2];
    let lo: u64 = lo_text
        .parse()
        .map_err(|_| CastleError::InvalidNodePattern(pattern.to_string()))?;
    let hi: u64 = caps[3]
        .parse()
        .map_err(|_| CastleError::InvalidNodePattern(pattern.to_string()))?;
    if lo > hi || hi - lo >= MAX_PATTERN_NODES {
        return Err(CastleError::InvalidNodePattern(pattern.to_string()));
    }
    let width = if lo_text.len() > 1 && lo_text.starts_with('0') {
        lo_text.len()
    } else {
        0
    };
    Ok((lo..=hi)
        .map(|i| format!("{}{:0width$}{}", &caps[1], i, &caps[4], width = width))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleKind;

    const SPEC: &str = r#"{
        "conf": {"kafkaPath": "/src/kafka"},
        "nodes": {
            "node[0-2]": {"roleNames": ["broker", "docker"]},
            "node3": {
                "roleNames": ["zooKeeper", "docker"],
                "rolePatches": {"docker": {"sshPort": 2200}}
            }
        },
        "roles": {
            "broker": {"type": "broker"},
            "zooKeeper": {"type": "zooKeeper"},
            "docker": {"type": "dockerNode", "imageId": "%{CASTLE_IMAGE}"}
        }
    }"#;

    fn lookup(key: &str) -> Option<String> {
        (key == "CASTLE_IMAGE").then(|| "castle-ubuntu".to_string())
    }

    #[test]
    fn expands_numeric_ranges() {
        assert_eq!(
            expand_node_pattern("node[0-2]").unwrap(),
            vec!["node0", "node1", "node2"]
        );
        assert_eq!(
            expand_node_pattern("n[08-10]x").unwrap(),
            vec!["n08x", "n09x", "n10x"]
        );
        assert_eq!(expand_node_pattern("solo").unwrap(), vec!["solo"]);
    }

    #[test]
    fn oversized_ranges_are_rejected() {
        assert_eq!(expand_node_pattern("n[1-10000]").unwrap().len(), 10_000);
        for bad in ["n[0-10000]", "n[0-99999999999999999]"] {
            assert!(matches!(
                expand_node_pattern(bad),
                Err(CastleError::InvalidNodePattern(p)) if p == bad
            ));
        }
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["node[2-0]", "node[a-b]", "node[0-1][0-1]", "node[0-", ""] {
            assert!(
                matches!(
                    expand_node_pattern(bad),
                    Err(CastleError::InvalidNodePattern(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn parse_substitutes_and_merges_patches() {
        let spec = CastleClusterSpec::parse(SPEC, lookup).unwrap();
        assert_eq!(spec.conf.kafka_path, "/src/kafka");
        assert_eq!(
            spec.conf.global_timeout(),
            Duration::from_secs(DEFAULT_GLOBAL_TIMEOUT_SECS)
        );
        let nodes = spec.nodes_to_roles().unwrap();
        assert_eq!(
            nodes.keys().collect::<Vec<_>>(),
            vec!["node0", "node1", "node2", "node3"]
        );
        let node3 = &nodes["node3"];
        assert_eq!(node3[0].0, "zooKeeper");
        assert_eq!(node3[0].1.kind(), RoleKind::ZooKeeper);
        match &node3[1].1 {
            Role::DockerNode(d) => {
                assert_eq!(d.image_id, "castle-ubuntu");
                assert_eq!(d.ssh_port, 2200);
            }
            other => panic!("unexpected role {other:?}"),
        }
        match &nodes["node0"][1].1 {
            Role::DockerNode(d) => assert_eq!(d.ssh_port, 0),
            other => panic!("unexpected role {other:?}"),
        }
    }

    #[test]
    fn unset_castle_variable_fails_parse() {
        let err = CastleClusterSpec::parse(SPEC, |_| None).unwrap_err();
        assert!(err.to_string().contains("CASTLE_IMAGE"));
    }

    #[test]
    fn colliding_patterns_are_rejected() {
        let text = r#"{
            "nodes": {"node[0-1]": {"roleNames": []}, "node1": {"roleNames": []}},
            "roles": {}
        }"#;
        let spec = CastleClusterSpec::parse(text, |_| None).unwrap();
        assert!(matches!(
            spec.nodes_to_roles(),
            Err(CastleError::NodeNameCollision(ref n)) if n == "node1"
        ));
    }

    #[test]
    fn unknown_and_duplicate_roles_are_rejected() {
        let unknown = r#"{"nodes": {"node0": {"roleNames": ["nope"]}}, "roles": {}}"#;
        let spec = CastleClusterSpec::parse(unknown, |_| None).unwrap();
        assert!(matches!(
            spec.nodes_to_roles(),
            Err(CastleError::UnknownRole { .. })
        ));

        let dup = r#"{
            "nodes": {"node0": {"roleNames": ["b1", "b2"]}},
            "roles": {"b1": {"type": "broker"}, "b2": {"type": "broker"}}
        }"#;
        let spec = CastleClusterSpec::parse(dup, |_| None).unwrap();
        assert!(matches!(
            spec.nodes_to_roles(),
            Err(CastleError::DuplicateRole { .. })
        ));
    }

    #[test]
    fn positive_global_timeout_is_used() {
        let conf = CastleClusterConf {
            global_timeout: 30,
            ..Default::default()
        };
        assert_eq!(conf.global_timeout(), Duration::from_secs(30));
    }
}
