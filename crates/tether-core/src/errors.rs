use std::fmt;

/// Status code assumed when a socket could not be created at all.
pub const DEFAULT_CLOSE_CODE: u16 = 428;

/// Status code assumed when a lifecycle stream ends without a close notification.
pub const LOST_CLOSE_CODE: u16 = 408;

/// Classification of a socket close, keyed by numeric status code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    BadSession,
    UnavailableService,
    RestartRequired,
    LoggedOut,
    Forbidden,
    NotLoggedIn,
    Unknown(Option<u16>),
}

impl DisconnectReason {
    pub fn classify(status_code: Option<u16>) -> Self {
        match status_code {
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::ConnectionLost,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(503) => Self::UnavailableService,
            Some(515) => Self::RestartRequired,
            Some(401) => Self::LoggedOut,
            Some(403) => Self::Forbidden,
            Some(463) => Self::NotLoggedIn,
            other => Self::Unknown(other),
        }
    }

    /// Whether the session should reconnect after this close.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::Forbidden)
    }

    /// Whether the persisted session must be deleted after this close.
    pub fn deletes_session(self) -> bool {
        matches!(self, Self::LoggedOut | Self::Forbidden | Self::NotLoggedIn)
    }

    pub fn status_code(self) -> Option<u16> {
        match self {
            Self::ConnectionClosed => Some(428),
            Self::ConnectionLost => Some(408),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::UnavailableService => Some(503),
            Self::RestartRequired => Some(515),
            Self::LoggedOut => Some(401),
            Self::Forbidden => Some(403),
            Self::NotLoggedIn => Some(463),
            Self::Unknown(code) => code,
        }
    }

    /// Short classification string for logging.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionReplaced => "connection_replaced",
            Self::BadSession => "bad_session",
            Self::UnavailableService => "unavailable_service",
            Self::RestartRequired => "restart_required",
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::NotLoggedIn => "not_logged_in",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error surfaced to the caller of `connect()`.
///
/// Recoverable closes never reach the caller; they drive reconnection.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed ({status_code:?}): {message}")]
    Closed {
        message: String,
        status_code: Option<u16>,
        recoverable: bool,
    },
    #[error("reconnect retries exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("pairing required but session runs in background sync mode")]
    PairingRequired,
    #[error("client is shutting down")]
    ShuttingDown,
    #[error("connect aborted by disconnect")]
    Aborted,
}

impl ConnectionError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Closed { recoverable, .. } => *recoverable,
            Self::ShuttingDown | Self::Aborted => true,
            Self::RetriesExhausted { .. } | Self::PairingRequired => false,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Closed { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::PairingRequired => "pairing_required",
            Self::ShuttingDown => "shutting_down",
            Self::Aborted => "aborted",
        }
    }
}

/// Errors raised by a [`Transport`](crate::transport::Transport) or its sockets.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {message}")]
    Connect {
        message: String,
        status_code: Option<u16>,
    },
    #[error("socket closed")]
    Closed,
    #[error("request failed: {0}")]
    Request(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
}

impl TransportError {
    /// Status code a synthesized close should carry for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Connect {
                status_code: Some(code),
                ..
            } => *code,
            Self::Timeout(_) => LOST_CLOSE_CODE,
            _ => DEFAULT_CLOSE_CODE,
        }
    }
}
