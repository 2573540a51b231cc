use crate::resources::machine::MachineStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the orchestration core.
///
/// `NotFound` and `InvalidRequest` are client errors; everything else is
/// surfaced to callers as an opaque server error and logged with full detail
/// at the API boundary. Health-check exhaustion is not an error: it resolves
/// to a `failed` status, observable only through get/wait.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("machine not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("runtime start failure: {0}")]
    RuntimeStart(String),

    #[error("runtime shutdown failure: {0}")]
    RuntimeShutdown(String),

    #[error("illegal status transition: {from:?} -> {to}")]
    InvalidTransition {
        from: Option<MachineStatus>,
        to: MachineStatus,
    },

    #[error("store error: {0}")]
    Store(#[from] heed::Error),

    #[error("corrupt machine record: {0}")]
    CorruptRecord(#[from] serde_json::Error),

    #[error("guest request failed: {0}")]
    Guest(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(id: impl AsRef<str>) -> Self {
        Self::NotFound(id.as_ref().to_string())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn runtime_start(msg: impl Into<String>) -> Self {
        Self::RuntimeStart(msg.into())
    }

    pub fn runtime_shutdown(msg: impl Into<String>) -> Self {
        Self::RuntimeShutdown(msg.into())
    }
}
