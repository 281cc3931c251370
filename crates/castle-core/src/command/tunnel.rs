use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};

use super::SshTarget;
use crate::cluster::CastleNode;
use crate::error::{CastleError, Result};
use crate::util::join_args;

const TUNNEL_ACTIVE: &str = "The ssh tunnel is now active.";
const MAX_TRIES: usize = 10;

/// An `ssh -L` forward from a local port to a port on the node.
///
/// The ssh process is killed when the tunnel is dropped.
pub struct PortTunnel {
    child: Child,
    local_port: u16,
}

impl PortTunnel {
    pub(crate) fn open(node: &CastleNode, target: &SshTarget, remote_port: u16) -> Result<Self> {
        if target.dns.is_empty() {
            return Err(CastleError::Usage(format!(
                "No DNS address configured for {}",
                node.name()
            )));
        }
        let mut tries = 0;
        loop {
            let local_port = free_local_port()?;
            match Self::try_open(node, target, local_port, remote_port) {
                Ok(child) => return Ok(Self { child, local_port }),
                Err(e) => {
                    tries += 1;
                    node.log().info(&format!(
                        "Unable to create ssh tunnel on local port {local_port}: {e}"
                    ));
                    if tries >= MAX_TRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn try_open(
        node: &CastleNode,
        target: &SshTarget,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Child> {
        let mut args = target.preamble();
        args.extend([
            "-L".to_string(),
            format!("{local_port}:localhost:{remote_port}"),
            target.dns.clone(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-n".to_string(),
            "--".to_string(),
            "echo".to_string(),
            format!("\"{TUNNEL_ACTIVE}\""),
            "&&".to_string(),
            "sleep".to_string(),
            "1000000".to_string(),
        ]);
        let line = join_args(&args);
        node.log()
            .debug(&format!("** {}: CREATING SSH TUNNEL: {line}", node.name()));
        let mut child = Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut first = String::new();
        let read = match child.stdout.take() {
            Some(stdout) => BufReader::new(stdout).read_line(&mut first),
            None => Ok(0),
        };
        if !matches!(read, Ok(n) if n > 0) || first.trim_end() != TUNNEL_ACTIVE {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CastleError::Tunnel(format!(
                "read unexpected line from ssh tunnel process: {:?}",
                first.trim_end()
            )));
        }
        node.log()
            .debug(&format!("** {}: TUNNEL ESTABLISHED: {line}", node.name()));
        Ok(child)
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn close(self) {}
}

impl Drop for PortTunnel {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
