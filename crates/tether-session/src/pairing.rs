//! Pairing offers: caller-supplied handlers and the interactive prompt.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tether_core::errors::TransportError;
use tether_core::ids::SessionId;
use tether_core::transport::Socket;
use tether_settings::{PairingMethodSetting, PairingSettings};
use tokio::io::{AsyncBufReadExt, BufReader};

/// How the operator answers a pairing offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairingMethod {
    /// Render the offered payload as a QR reference.
    Qr,
    /// Request a numeric code for a phone number.
    Phone,
}

impl From<PairingMethodSetting> for PairingMethod {
    fn from(setting: PairingMethodSetting) -> Self {
        match setting {
            PairingMethodSetting::Qr => Self::Qr,
            PairingMethodSetting::Phone => Self::Phone,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("no phone number available for code pairing")]
    MissingPhone,
    #[error("prompt input closed")]
    InputClosed,
    #[error("prompt io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Interactive side of pairing. Only one prompt runs at a time per hub.
#[async_trait]
pub trait PairingPrompt: Send + Sync {
    async fn choose_method(&self, session_id: SessionId) -> Result<PairingMethod, PairingError>;

    async fn phone_number(&self, session_id: SessionId) -> Result<String, PairingError>;

    fn show_qr(&self, session_id: SessionId, payload: &str);

    fn show_code(&self, session_id: SessionId, code: &str);
}

/// Prompt driven by `pairing` settings, falling back to stdin, writing to stderr.
#[derive(Clone, Debug, Default)]
pub struct ConfiguredPrompt {
    settings: PairingSettings,
}

impl ConfiguredPrompt {
    pub fn new(settings: PairingSettings) -> Self {
        Self { settings }
    }

    async fn ask(question: &str) -> Result<String, PairingError> {
        eprint!("{question}");
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Err(PairingError::InputClosed);
        }
        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl PairingPrompt for ConfiguredPrompt {
    async fn choose_method(&self, session_id: SessionId) -> Result<PairingMethod, PairingError> {
        if let Some(method) = self.settings.method {
            return Ok(method.into());
        }
        let answer = Self::ask(&format!(
            "session {session_id}: pair with [q]r code or [p]hone code? "
        ))
        .await?;
        Ok(match answer.to_ascii_lowercase().as_str() {
            "p" | "phone" | "code" => PairingMethod::Phone,
            _ => PairingMethod::Qr,
        })
    }

    async fn phone_number(&self, session_id: SessionId) -> Result<String, PairingError> {
        if let Some(phone) = self.settings.phone.as_deref().filter(|p| !p.is_empty()) {
            return Ok(phone.to_string());
        }
        let answer = Self::ask(&format!("session {session_id}: phone number (digits only): ")).await?;
        let digits: String = answer.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(PairingError::MissingPhone);
        }
        Ok(digits)
    }

    fn show_qr(&self, session_id: SessionId, payload: &str) {
        eprintln!("session {session_id}: scan this pairing reference with your device:\n{payload}");
    }

    fn show_code(&self, session_id: SessionId, code: &str) {
        eprintln!("session {session_id}: pairing code {code}");
    }
}

/// Bound "request numeric code" capability handed to pairing handlers.
#[derive(Clone)]
pub struct PairingCodeRequester {
    socket: Arc<dyn Socket>,
}

impl PairingCodeRequester {
    pub(crate) fn new(socket: Arc<dyn Socket>) -> Self {
        Self { socket }
    }

    pub async fn request(&self, phone: &str) -> Result<String, TransportError> {
        self.socket.request_pairing_code(phone).await
    }
}

impl fmt::Debug for PairingCodeRequester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCodeRequester")
            .field("session_id", &self.socket.session_id())
            .finish()
    }
}

/// One pairing offer, as seen by a [`PairingHandler`].
#[derive(Clone, Debug)]
pub struct PairingRequest {
    pub session_id: SessionId,
    pub payload: String,
    pub requester: PairingCodeRequester,
}

/// Caller-supplied pairing callback. Replaces the interactive prompt.
pub type PairingHandler = Arc<dyn Fn(PairingRequest) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`PairingHandler`].
pub fn pairing_handler<F, Fut>(f: F) -> PairingHandler
where
    F: Fn(PairingRequest) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}
