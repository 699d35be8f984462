//! Telemetry reporting surface.
//!
//! [`Reporter`] is what the rest of the program talks to:
//! - [`Reporter::init`] resolves and connects the server endpoint and sets the
//!   receive deadline; any failure is returned and reporting cannot start.
//! - [`Reporter::report`] serialises one [`Telemetry`] reading to JSON and
//!   runs a single POST exchange, returning its [`ExchangeOutcome`].
//!
//! `report` takes `&self` so one reporter can be shared between threads.  The
//! engine sits behind a mutex that is only ever *tried*: a call that arrives
//! while another exchange is in flight is rejected with
//! [`ExchangeError::Busy`] instead of queueing behind it.

use std::sync::{Mutex, TryLockError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{telemetry_path, Config, ConfigError};
use crate::exchange::{ExchangeEngine, ExchangeError, ExchangeOutcome};
use crate::packet::Request;
use crate::socket::{Transport, TransportError, UdpSession};

/// One environment reading, sent as `{"temperature":..,"humidity":..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub temperature: i32,
    pub humidity: i32,
}

/// Failures of [`Reporter::init`].
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("could not set up transport: {0}")]
    Transport(#[from] TransportError),
}

pub struct Reporter<T = UdpSession> {
    engine: Mutex<ExchangeEngine<T>>,
    path: String,
}

impl Reporter<UdpSession> {
    /// Connect to the configured server and apply the receive deadline.
    pub fn init(config: &Config) -> Result<Self, SetupError> {
        config.validate()?;
        let mut session = UdpSession::connect(&config.host, config.port)?;
        session.configure_timeout(config.timeout)?;
        log::info!("[report] CoAP client initialized");
        Ok(Self::with_transport(session, &config.device_id))
    }
}

impl<T: Transport> Reporter<T> {
    pub fn with_transport(transport: T, device_id: &str) -> Self {
        Self::with_engine(ExchangeEngine::new(transport), device_id)
    }

    pub fn with_engine(engine: ExchangeEngine<T>, device_id: &str) -> Self {
        Self {
            engine: Mutex::new(engine),
            path: telemetry_path(device_id),
        }
    }

    /// Resource path readings are POSTed to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Run one report exchange.  Never retries; the caller decides when to
    /// try again.
    pub fn report(&self, telemetry: &Telemetry) -> ExchangeOutcome {
        let payload = match serde_json::to_vec(telemetry) {
            Ok(p) => p,
            Err(e) => return ExchangeOutcome::Failed(e.into()),
        };

        let mut engine = match self.engine.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                log::warn!("[report] previous exchange still in flight; skipping");
                return ExchangeOutcome::Failed(ExchangeError::Busy);
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                // A previous exchange panicked part-way; its token is stale.
                let mut guard = poisoned.into_inner();
                guard.reset();
                self.engine.clear_poison();
                guard
            }
        };

        let outcome = engine.exchange(&Request::post_json(&self.path, &payload));
        if let ExchangeOutcome::Failed(e) = &outcome {
            log::warn!("[report] POST request failed: {e}");
        }
        outcome
    }
}
