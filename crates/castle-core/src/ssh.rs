//! `castle ssh <node...> [command...]`: run a command on nodes through their
//! uplinks, or open an interactive shell on one node.

use std::collections::BTreeSet;

use crate::cluster::CastleCluster;
use crate::error::{CastleError, Result};

pub const SSH_COMMAND: &str = "ssh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastleSshArgs {
    pub node_names: Vec<String>,
    /// Empty for an interactive session.
    pub command: Vec<String>,
}

/// Split the CLI targets following `ssh` into node selectors and a command.
///
/// Node selectors are node names, node indices, or `all`; the first argument
/// which is none of these starts the command.
pub fn parse<S: AsRef<str>>(nodes: &BTreeSet<String>, targets: &[S]) -> Result<CastleSshArgs> {
    let start = targets
        .iter()
        .position(|t| t.as_ref() == SSH_COMMAND)
        .ok_or_else(|| CastleError::Usage("Ssh command not found.".to_string()))?;
    let mut selected = BTreeSet::new();
    let mut rest = targets[start + 1..].iter().map(|t| t.as_ref()).peekable();
    while let Some(arg) = rest.peek().copied() {
        if arg == "all" {
            selected.extend(nodes.iter().cloned());
        } else if nodes.contains(arg) {
            selected.insert(arg.to_string());
        } else if let Some(name) = arg.parse::<usize>().ok().and_then(|i| nodes.iter().nth(i)) {
            selected.insert(name.clone());
        } else {
            break;
        }
        rest.next();
    }
    if selected.is_empty() {
        return Err(CastleError::Usage(
            "You must specify at least one node to ssh to.".to_string(),
        ));
    }
    Ok(CastleSshArgs {
        node_names: selected.into_iter().collect(),
        command: rest.map(str::to_string).collect(),
    })
}

/// Run the ssh target. Returns the first non-zero exit code, or zero.
pub fn run<S: AsRef<str>>(cluster: &CastleCluster, targets: &[S]) -> Result<i32> {
    let names: BTreeSet<String> = cluster.nodes().keys().cloned().collect();
    let args = parse(&names, targets)?;
    if args.command.is_empty() && args.node_names.len() != 1 {
        return Err(CastleError::Usage(
            "An interactive ssh session needs exactly one node.".to_string(),
        ));
    }
    let mut result = 0;
    for name in &args.node_names {
        let node = cluster
            .node(name)
            .ok_or_else(|| CastleError::UnknownNode(name.clone()))?;
        tracing::debug!(node = %name, command = ?args.command, "ssh");
        let code = node
            .uplink()
            .command(node)
            .args(args.command.iter().cloned())
            .exec()?;
        if code != 0 {
            tracing::warn!(node = %name, code, "ssh command failed");
            if result == 0 {
                result = code;
            }
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> BTreeSet<String> {
        ["node0", "node1", "node2"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn splits_nodes_from_command() {
        let args = parse(&nodes(), &["ssh", "node1", "2", "ls", "-l", "/mnt"]).unwrap();
        assert_eq!(args.node_names, vec!["node1", "node2"]);
        assert_eq!(args.command, vec!["ls", "-l", "/mnt"]);
    }

    #[test]
    fn all_selects_every_node() {
        let args = parse(&nodes(), &["ssh", "all", "hostname"]).unwrap();
        assert_eq!(args.node_names.len(), 3);
        assert_eq!(args.command, vec!["hostname"]);
    }

    #[test]
    fn interactive_session_has_no_command() {
        let args = parse(&nodes(), &["ssh", "node0"]).unwrap();
        assert_eq!(args.node_names, vec!["node0"]);
        assert!(args.command.is_empty());
    }

    #[test]
    fn missing_ssh_or_nodes_is_a_usage_error() {
        let err = parse(&nodes(), &["up"]).unwrap_err();
        assert_eq!(err.to_string(), "Ssh command not found.");
        assert!(matches!(
            parse(&nodes(), &["ssh", "node9", "ls"]),
            Err(CastleError::Usage(_))
        ));
    }
}
