use thiserror::Error;

/// Error taxonomy for the execution pipeline. Each variant corresponds to a
/// documented failure mode rather than an incidental implementation detail.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid rendition settings: {0}")]
    InvalidSettings(String),

    #[error("named pipes are not supported on this platform")]
    PlatformUnsupported,

    #[error("transcoder process exited with an error")]
    TranscoderFailed,

    #[error("packager process exited with an error")]
    PackagerFailed,

    #[error("job was cancelled via the soft time limit")]
    SoftTimeLimitExceeded,

    #[error("controller already started")]
    AlreadyStarted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
