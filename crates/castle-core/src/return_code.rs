use serde::{Deserialize, Serialize};

/// Process-wide outcome of a castle run, ordered by severity.
///
/// `Success < InProgress < ClusterFailed < ToolFailed`. The numeric value is
/// the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CastleReturnCode {
    Success,
    InProgress,
    ClusterFailed,
    ToolFailed,
}

impl CastleReturnCode {
    pub fn code(self) -> i32 {
        match self {
            CastleReturnCode::Success => 0,
            CastleReturnCode::InProgress => 1,
            CastleReturnCode::ClusterFailed => 2,
            CastleReturnCode::ToolFailed => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CastleReturnCode::Success => "success",
            CastleReturnCode::InProgress => "in_progress",
            CastleReturnCode::ClusterFailed => "cluster_failed",
            CastleReturnCode::ToolFailed => "tool_failed",
        }
    }

    /// The more severe of two codes.
    pub fn worse(self, other: CastleReturnCode) -> CastleReturnCode {
        self.max(other)
    }

    pub(crate) fn from_u8(value: u8) -> CastleReturnCode {
        match value {
            0 => CastleReturnCode::Success,
            1 => CastleReturnCode::InProgress,
            2 => CastleReturnCode::ClusterFailed,
            _ => CastleReturnCode::ToolFailed,
        }
    }
}

impl std::fmt::Display for CastleReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
