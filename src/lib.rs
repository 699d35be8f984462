//! `coap-telemetry` — periodic environment telemetry over non-confirmable CoAP.
//!
//! # Architecture
//!
//! ```text
//!  scheduler (main.rs) ── report(reading) ──▶ ┌──────────────┐
//!                                             │   Reporter   │  JSON payload,
//!                                             └──────┬───────┘  single-flight
//!                                                    │
//!                                             ┌──────▼───────┐
//!                                             │ExchangeEngine│  request-and-wait
//!                                             └┬─────┬──────┬┘  state machine
//!                              token / msg id  │     │      │ datagrams
//!                                  ┌───────────▼┐ ┌──▼───┐ ┌▼───────────┐
//!                                  │ Correlator │ │codec │ │ UdpSession │
//!                                  └────────────┘ └──────┘ └────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]   — CoAP wire format (encode requests, decode replies)
//! - [`token`]    — tokens, message ids and the expected-token slot
//! - [`socket`]   — connected UDP session with a receive deadline
//! - [`exchange`] — one send → wait → correlate → decode cycle
//! - [`client`]   — the `init` / `report` surface used by the scheduler
//! - [`config`]   — reporter configuration
//! - [`sensor`]   — simulated temperature/humidity source

pub mod client;
pub mod config;
pub mod exchange;
pub mod packet;
pub mod sensor;
pub mod socket;
pub mod token;

pub use client::{Reporter, SetupError, Telemetry};
pub use config::{Config, ConfigError};
pub use exchange::{ExchangeEngine, ExchangeError, ExchangeOutcome, ExchangeState, Reply};
pub use packet::{decode_response, encode_request, DecodeError, EncodeError, Request};
pub use socket::{Received, Transport, TransportError, UdpSession};
pub use token::{Correlator, Token};
