use reqwest::StatusCode;

/// How a failure is handled by the retry loop and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt after a backoff delay.
    Transient,
    /// Retrying cannot help; the job fails immediately.
    Permanent,
    /// Continuing the run is pointless (disk full, output area unwritable).
    Fatal,
    /// The run was asked to stop. Not counted as a job failure.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("unsupported content type `{content_type}` for {url}")]
    UnsupportedContent { content_type: String, url: String },

    #[error("truncated body for {url}: received {received} of {expected} bytes")]
    PartialBody {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error("output `{path}` already exists")]
    OutputExists { path: String },

    #[error("remux failed: {reason}")]
    Remux { reason: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("output directory `{path}` is not usable: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl DownloadError {
    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn remux(reason: impl Into<String>) -> Self {
        Self::Remux {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Classify this error for the retry loop and the scheduler.
    ///
    /// Remux failures are transient: the raw fetch already succeeded, so a
    /// later attempt can still turn it into a playable file.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Cancelled => ErrorClass::Cancelled,
            Self::InvalidUrl { .. }
            | Self::UnsupportedContent { .. }
            | Self::OutputExists { .. }
            | Self::Configuration { .. } => ErrorClass::Permanent,
            Self::HttpStatus { status, .. } => {
                if status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            Self::Network { source } => {
                if source.is_builder() || source.is_redirect() {
                    ErrorClass::Permanent
                } else {
                    ErrorClass::Transient
                }
            }
            Self::PartialBody { .. } | Self::Remux { .. } => ErrorClass::Transient,
            Self::Io { source } => {
                if is_fatal_io(source) {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Transient
                }
            }
            Self::OutputDir { .. } => ErrorClass::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

/// Local write errors that retrying against the same disk cannot fix.
fn is_fatal_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::StorageFull
            | std::io::ErrorKind::QuotaExceeded
            | std::io::ErrorKind::ReadOnlyFilesystem
            | std::io::ErrorKind::PermissionDenied
    )
}
