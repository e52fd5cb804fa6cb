use std::io;

/// All error types surfaced by the supervisor.
///
/// Fatal variants (`BindFailed`, `InheritFailed`, `ConfigInvalid`) are only ever
/// returned from startup or supervisor-level functions and cause the process to
/// exit non-zero. The rest are confined to a single connection or a single
/// restart attempt and never propagate past their own task boundary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    BindFailed(io::Error),

    #[error("failed to inherit listener: {0}")]
    InheritFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("transient accept error: {0}")]
    AcceptTransient(io::Error),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(io::Error),

    #[error("remote address {0} is not in the allow-list")]
    DisallowedRemote(std::net::SocketAddr),

    #[error("connection handler failed: {0}")]
    HandlerFailed(String),

    #[error("restart handover failed: {0}")]
    RestartHandoverFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl ServerError {
    /// Machine-readable error code, for log fields and exit-path matching.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::BindFailed(_) => "bind_failed",
            ServerError::InheritFailed(_) => "inherit_failed",
            ServerError::ConfigInvalid(_) => "config_invalid",
            ServerError::AcceptTransient(_) => "accept_transient",
            ServerError::TlsHandshakeFailed(_) => "tls_handshake_failed",
            ServerError::DisallowedRemote(_) => "disallowed_remote",
            ServerError::HandlerFailed(_) => "handler_failed",
            ServerError::RestartHandoverFailed(_) => "restart_handover_failed",
            ServerError::Io(_) => "io_error",
            ServerError::TomlParse(_) => "config_parse_error",
        }
    }

    /// Whether this error is fatal to the owning process (vs. confined to one
    /// connection or one restart attempt).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::BindFailed(_) | ServerError::InheritFailed(_) | ServerError::ConfigInvalid(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
