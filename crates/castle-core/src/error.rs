use thiserror::Error;

#[derive(Debug, Error)]
pub enum CastleError {
    #[error("duplicate action id: {0}")]
    DuplicateAction(String),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no uplink roles found for node {0}")]
    MissingUplinkRole(String),

    #[error("found two uplink roles for {node}: {first} and {second}")]
    DuplicateUplinkRole {
        node: String,
        first: String,
        second: String,
    },

    #[error("node {node} has more than one role of type {kind}")]
    DuplicateRole { node: String, kind: String },

    #[error("unknown role '{role}' referenced by node {node}")]
    UnknownRole { node: String, role: String },

    #[error("invalid node name pattern '{0}'")]
    InvalidNodePattern(String),

    #[error("node name {0} is produced by more than one node pattern")]
    NodeNameCollision(String),

    #[error("invalid configuration: {0}")]
    InvalidConf(String),

    #[error("command `{command}` failed with exit code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("ssh tunnel error: {0}")]
    Tunnel(String),

    #[error("cloud error: {0}")]
    Cloud(String),

    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CastleError {
    /// Exit code carried by a `CommandFailed` error, if this is one.
    pub fn command_exit_code(&self) -> Option<i32> {
        match self {
            CastleError::CommandFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CastleError>;
