use thiserror::Error;

#[derive(Error, Debug)]
pub enum MusterError {
    #[error("Unable to reach the control-plane publish endpoint")]
    ControlPlaneUnreachable,

    #[error("Authentication denied by the control plane")]
    AuthenticationDenied,

    #[error("Unknown nodegroup: {0}")]
    UnknownNodegroup(String),

    #[error("Invalid nodegroup {name}: {reason}")]
    InvalidNodegroup { name: String, reason: String },

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Collection interrupted for job {job_id}")]
    CollectionInterrupted { job_id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MusterError>;
