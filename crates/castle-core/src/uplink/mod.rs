//! Uplinks: the channel through which castle reaches a node.
//!
//! An uplink holds only the shared cloud client. Node state (container name,
//! instance id, ssh settings) lives in the node's roles and is read on every
//! call, so uplinks never hold a reference back into the cluster.

use crate::cloud::CloudFuture;
use crate::cluster::{CastleCluster, CastleNode};
use crate::command::{PortTunnel, RemoteCommand};
use crate::error::Result;

pub mod docker;
pub mod ec2;

pub trait Uplink: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// A command which runs on `node`.
    fn command<'a>(&self, node: &'a CastleNode) -> RemoteCommand<'a>;

    /// The address other nodes use to reach `node`.
    fn internal_dns(&self, node: &CastleNode) -> String;

    /// True once the node's machine has been created.
    fn started(&self, node: &CastleNode) -> bool;

    /// True if commands can currently reach the node.
    fn can_login(&self, node: &CastleNode) -> bool;

    fn open_port(&self, node: &CastleNode, port: u16) -> Result<PortTunnel> {
        self.command(node).open_tunnel(port)
    }

    /// Create the node's machine, recording its identity in the node's role.
    fn startup(&self, cluster: &CastleCluster, node: &CastleNode) -> anyhow::Result<()>;

    /// Report whether the node's machine still exists.
    fn check(&self, node: &CastleNode) -> anyhow::Result<()>;

    /// Destroy the node's machine.
    fn shutdown(&self, node: &CastleNode) -> anyhow::Result<CloudFuture<()>>;

    /// Destroy every machine this backend can find, whether or not it belongs
    /// to this cluster.
    fn shutdown_all(&self, node: &CastleNode) -> anyhow::Result<()>;
}
