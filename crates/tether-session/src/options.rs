use std::fmt;
use std::time::Duration;

use tether_settings::SessionSettings;

use crate::backoff::{self, Backoff};
use crate::hooks::Hooks;
use crate::pairing::PairingHandler;

/// Per-client behaviour.
#[derive(Clone)]
pub struct ClientOptions {
    /// No interactive output; pairing offers without a handler are ignored.
    pub silent: bool,
    /// Background restore: never prompts, never triggers another sweep.
    pub sync_mode: bool,
    pub max_retries: u32,
    pub backoff: Backoff,
    pub pairing_handler: Option<PairingHandler>,
    pub hooks: Hooks,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_settings(&SessionSettings::default())
    }
}

impl ClientOptions {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            silent: false,
            sync_mode: false,
            max_retries: settings.max_retries,
            backoff: backoff::exponential(settings.base_delay_ms, settings.max_delay_ms),
            pairing_handler: None,
            hooks: Hooks::default(),
        }
    }

    /// Switch to background restore: silent, sync mode, a small retry ceiling.
    #[must_use]
    pub fn background(self, max_retries: u32) -> Self {
        self.silent(true).sync_mode(true).max_retries(max_retries)
    }

    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    #[must_use]
    pub fn sync_mode(mut self, sync_mode: bool) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn constant_backoff(self, delay: Duration) -> Self {
        self.backoff(backoff::constant(delay))
    }

    #[must_use]
    pub fn pairing_handler(mut self, handler: PairingHandler) -> Self {
        self.pairing_handler = Some(handler);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("silent", &self.silent)
            .field("sync_mode", &self.sync_mode)
            .field("max_retries", &self.max_retries)
            .field("pairing_handler", &self.pairing_handler.is_some())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
