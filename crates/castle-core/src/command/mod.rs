//! Running processes on behalf of a node.
//!
//! [`NodeShellRunner`] runs a local process and records it in the node log.
//! [`RemoteCommand`] builds the ssh or rsync command line that reaches a node
//! and hands it to a `NodeShellRunner`.

use std::io::Write;
use std::process::{Command, Stdio};

use crate::cluster::CastleNode;
use crate::error::{CastleError, Result};
use crate::util::join_args;

mod tunnel;

pub use tunnel::PortTunnel;

/// Exit status and captured output of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code; `-1` when the process was killed by a signal.
    pub status: i32,
    pub output: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

pub struct NodeShellRunner<'a> {
    node: &'a CastleNode,
    args: Vec<String>,
    capture_stderr: bool,
    log_output_on_success: bool,
    stdin: Option<Vec<u8>>,
}

impl<'a> NodeShellRunner<'a> {
    pub fn new<I, S>(node: &'a CastleNode, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node,
            args: args.into_iter().map(Into::into).collect(),
            capture_stderr: false,
            log_output_on_success: true,
            stdin: None,
        }
    }

    /// Include stderr in the captured output. Stdout is always captured.
    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// When false, output only reaches the node log if the process fails.
    pub fn log_output_on_success(mut self, log: bool) -> Self {
        self.log_output_on_success = log;
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn command_line(&self) -> &[String] {
        &self.args
    }

    pub fn run(&self) -> Result<ShellOutput> {
        let line = join_args(&self.args);
        let mut cmd = self.build_command()?;
        let node = self.node;
        node.log()
            .debug(&format!("** {}: RUNNING {line}", node.name()));
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn().map_err(|e| spawn_error(&self.args, e))?;

        let writer = match (self.stdin.clone(), child.stdin.take()) {
            (Some(data), Some(mut pipe)) => Some(std::thread::spawn(move || pipe.write_all(&data))),
            _ => None,
        };
        let out = child.wait_with_output()?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(e)) => node.log().warn(&format!("unable to write stdin: {e}")),
                Err(_) => node.log().warn("stdin writer panicked"),
                Ok(Ok(())) => {}
            }
        }

        let status = out.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        if self.log_output_on_success || status != 0 {
            node.log().write_output(&stdout);
            node.log().write_output(&stderr);
        }
        node.log().debug(&format!(
            "** {}: FINISHED {line} with RESULT {status}",
            node.name()
        ));

        let mut output = stdout.into_owned();
        if self.capture_stderr {
            output.push_str(&stderr);
        }
        Ok(ShellOutput { status, output })
    }

    /// Run, treating a non-zero exit as an error. Returns the captured output.
    pub fn must_run(&self) -> Result<String> {
        let out = self.run()?;
        if !out.success() {
            return Err(CastleError::CommandFailed {
                command: join_args(&self.args),
                code: out.status,
            });
        }
        Ok(out.output)
    }

    /// Run attached to the caller's terminal and return the exit status.
    pub fn exec(&self) -> Result<i32> {
        let node = self.node;
        node.log()
            .info(&format!("** {}: SSH {}", node.name(), join_args(&self.args)));
        let status = self
            .build_command()?
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| spawn_error(&self.args, e))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn build_command(&self) -> Result<Command> {
        let (program, rest) = self
            .args
            .split_first()
            .ok_or_else(|| CastleError::Usage("empty command line".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }
}

fn spawn_error(args: &[String], e: std::io::Error) -> CastleError {
    let program = args.first().map(String::as_str).unwrap_or("");
    CastleError::Io(std::io::Error::new(
        e.kind(),
        format!("unable to run {program}: {e}"),
    ))
}

/// How to reach a node over ssh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshTarget {
    pub dns: String,
    pub user: String,
    /// Zero means the ssh default.
    pub port: u16,
    pub identity_file: String,
}

impl SshTarget {
    /// `ssh` plus the identity, user, port and host-key options.
    pub fn preamble(&self) -> Vec<String> {
        let mut args = vec!["ssh".to_string()];
        if !self.identity_file.is_empty() {
            args.push("-i".to_string());
            args.push(self.identity_file.clone());
        }
        if !self.user.is_empty() {
            args.push("-l".to_string());
            args.push(self.user.clone());
        }
        if self.port != 0 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }
        // Containers and fresh instances have unknown host keys.
        args.push("-o".to_string());
        args.push("StrictHostKeyChecking=no".to_string());
        args
    }
}

#[derive(Debug, Clone)]
enum Operation {
    Ssh(Vec<String>),
    SyncTo { local: String, remote: String },
    SyncFrom { remote: String, local: String },
}

/// A command to run against a node through its uplink.
///
/// Exactly one of `args`, `sync_to` or `sync_from` applies; the last one set
/// wins.
pub struct RemoteCommand<'a> {
    node: &'a CastleNode,
    target: SshTarget,
    operation: Option<Operation>,
    capture_stderr: bool,
    log_output_on_success: bool,
    stdin: Option<Vec<u8>>,
}

impl<'a> RemoteCommand<'a> {
    pub fn new(node: &'a CastleNode, target: SshTarget) -> Self {
        Self {
            node,
            target,
            operation: None,
            capture_stderr: false,
            log_output_on_success: true,
            stdin: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operation = Some(Operation::Ssh(args.into_iter().map(Into::into).collect()));
        self
    }

    /// Copy `local` to `remote` on the node, deleting extraneous files.
    pub fn sync_to(mut self, local: impl Into<String>, remote: impl Into<String>) -> Self {
        self.operation = Some(Operation::SyncTo {
            local: local.into(),
            remote: remote.into(),
        });
        self
    }

    /// Copy `remote` on the node to `local`, deleting extraneous files.
    pub fn sync_from(mut self, remote: impl Into<String>, local: impl Into<String>) -> Self {
        self.operation = Some(Operation::SyncFrom {
            remote: remote.into(),
            local: local.into(),
        });
        self
    }

    pub fn capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    pub fn log_output_on_success(mut self, log: bool) -> Self {
        self.log_output_on_success = log;
        self
    }

    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn command_line(&self) -> Result<Vec<String>> {
        if self.target.dns.is_empty() {
            return Err(CastleError::Usage(format!(
                "No DNS address configured for {}",
                self.node.name()
            )));
        }
        let dns = &self.target.dns;
        let rsync = |from: String, to: String| {
            vec![
                "rsync".to_string(),
                "-aqi".to_string(),
                "--delete".to_string(),
                "-e".to_string(),
                self.target.preamble().join(" "),
                from,
                to,
            ]
        };
        match &self.operation {
            None => Err(CastleError::Usage(
                "You must supply ssh arguments.".to_string(),
            )),
            Some(Operation::Ssh(args)) => {
                let mut line = self.target.preamble();
                line.push(dns.clone());
                line.extend(args.iter().cloned());
                Ok(line)
            }
            Some(Operation::SyncTo { local, remote }) => {
                Ok(rsync(local.clone(), format!("{dns}:{remote}")))
            }
            Some(Operation::SyncFrom { remote, local }) => {
                Ok(rsync(format!("{dns}:{remote}"), local.clone()))
            }
        }
    }

    fn runner(&self) -> Result<NodeShellRunner<'a>> {
        let mut runner = NodeShellRunner::new(self.node, self.command_line()?)
            .capture_stderr(self.capture_stderr)
            .log_output_on_success(self.log_output_on_success);
        if let Some(data) = &self.stdin {
            runner = runner.stdin(data.clone());
        }
        Ok(runner)
    }

    pub fn run(&self) -> Result<ShellOutput> {
        self.runner()?.run()
    }

    pub fn must_run(&self) -> Result<String> {
        self.runner()?.must_run()
    }

    pub fn exec(&self) -> Result<i32> {
        self.runner()?.exec()
    }

    /// Forward a free local port to `remote_port` on the node.
    pub fn open_tunnel(&self, remote_port: u16) -> Result<PortTunnel> {
        PortTunnel::open(self.node, &self.target, remote_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_cluster;

    fn target() -> SshTarget {
        SshTarget {
            dns: "localhost".to_string(),
            user: "ducker".to_string(),
            port: 32801,
            identity_file: "/w/ducker00.id_rsa".to_string(),
        }
    }

    #[test]
    fn preamble_skips_unset_fields() {
        let bare = SshTarget {
            dns: "host".to_string(),
            ..Default::default()
        };
        assert_eq!(
            bare.preamble(),
            vec!["ssh", "-o", "StrictHostKeyChecking=no"]
        );
        assert_eq!(
            target().preamble(),
            vec![
                "ssh",
                "-i",
                "/w/ducker00.id_rsa",
                "-l",
                "ducker",
                "-p",
                "32801",
                "-o",
                "StrictHostKeyChecking=no"
            ]
        );
    }

    #[test]
    fn ssh_and_rsync_command_lines() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node0").unwrap();

        let line = RemoteCommand::new(node, target())
            .args(["-n", "--", "echo"])
            .command_line()
            .unwrap();
        assert_eq!(&line[line.len() - 4..], &["localhost", "-n", "--", "echo"]);

        let line = RemoteCommand::new(node, target())
            .sync_to("/tmp/conf/", "/mnt/kafka/")
            .command_line()
            .unwrap();
        assert_eq!(&line[..4], &["rsync", "-aqi", "--delete", "-e"]);
        assert!(line[4].starts_with("ssh -i /w/ducker00.id_rsa"));
        assert_eq!(&line[5..], &["/tmp/conf/", "localhost:/mnt/kafka/"]);

        let line = RemoteCommand::new(node, target())
            .sync_from("/mnt/logs/", "/w/logs/node0/")
            .command_line()
            .unwrap();
        assert_eq!(&line[5..], &["localhost:/mnt/logs/", "/w/logs/node0/"]);
    }

    #[test]
    fn missing_dns_or_args_is_an_error() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node0").unwrap();
        let err = RemoteCommand::new(node, SshTarget::default())
            .args(["true"])
            .command_line()
            .unwrap_err();
        assert_eq!(err.to_string(), "No DNS address configured for node0");
        let err = RemoteCommand::new(node, target()).command_line().unwrap_err();
        assert_eq!(err.to_string(), "You must supply ssh arguments.");
    }

    #[cfg(unix)]
    #[test]
    fn runner_captures_output_and_logs() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node1").unwrap();
        let out = NodeShellRunner::new(node, ["sh", "-c", "cat; echo oops >&2; exit 3"])
            .stdin("hello\n")
            .run()
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.output, "hello\n");

        let err = NodeShellRunner::new(node, ["sh", "-c", "exit 4"])
            .must_run()
            .unwrap_err();
        assert_eq!(err.command_exit_code(), Some(4));

        let log = std::fs::read_to_string(node.log().path()).unwrap();
        assert!(log.contains("** node1: RUNNING sh -c \"cat; echo oops >&2; exit 3\""));
        assert!(log.contains("oops"));
        assert!(log.contains("with RESULT 3"));
    }

    #[cfg(unix)]
    #[test]
    fn stderr_is_captured_on_request() {
        let (_dir, cluster) = test_cluster();
        let node = cluster.node("node2").unwrap();
        let out = NodeShellRunner::new(node, ["sh", "-c", "echo out; echo err >&2"])
            .capture_stderr(true)
            .must_run()
            .unwrap();
        assert_eq!(out, "out\nerr\n");
    }
}
