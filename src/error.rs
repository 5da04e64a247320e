//! Error types for the scheduler

use thiserror::Error;

/// Result type for scheduler operations
pub type JolteonResult<T> = Result<T, JolteonError>;

/// Comprehensive error types for the performance-model/solver/executor stack
#[derive(Error, Debug)]
pub enum JolteonError {
    /// Malformed workflow config, non-DAG graph, or inconsistent parent/child sets
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Underlying I/O failure reading or writing a config/profile/param/sample file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure on a config/profile/param/sample file
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The function-management collaborator rejected a reconfiguration
    #[error("profile update failed for stage {stage}: {reason}")]
    ProfileUpdate { stage: String, reason: String },

    /// An invocation returned no `statusCode`/`data`, or its log lacked billing fields
    #[error("invocation error for stage {stage}: {reason}")]
    Invocation { stage: String, reason: String },

    /// Non-linear least squares failed to converge while fitting a stage
    #[error("fit error for stage {stage}: {reason}")]
    Fit { stage: String, reason: String },

    /// The PCP solver found no point satisfying every scenario constraint
    #[error("no feasible configuration found within {iterations} iterations")]
    Infeasible { iterations: usize },

    /// The user's bound is unreachable by any point in the decision box
    #[error("requested bound {bound} is not achievable for this workflow")]
    BoundViolation { bound: f64 },

    /// A stage index referenced in the workflow config does not exist
    #[error("stage index {0} out of range")]
    StageIndexOutOfRange(usize),

    /// A path (critical or secondary) referenced a non-existent edge
    #[error("invalid path: {0}")]
    InvalidPath(String),
}
