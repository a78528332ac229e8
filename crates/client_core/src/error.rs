use thiserror::Error;

/// Conditions callers are expected to branch on. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not logged in")]
    NotAuthenticated,
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("Fill all fields")]
    MissingFields,
    #[error("Profile image upload failed")]
    UploadFailed { status: u16 },
    #[error("session rejected by the server")]
    SessionRejected,
    #[error("{detail}")]
    Server { status: u16, detail: String },
}
