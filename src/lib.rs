#![deny(unreachable_pub)]

//! A two-sided limit quoting agent for a cryptocurrency derivatives
//! exchange.
//!
//! The agent keeps one buy and one sell limit order resting around the
//! mid of the public order book for a single instrument, re-centering
//! them as market prices and its own position move. It talks to two
//! independent exchange services:
//!
//! - the **trading gate**, a binary length-prefixed protocol over a
//!   long-lived TCP connection ([`gate`]), and
//! - the **book feed**, JSON over WebSocket ([`observer`]).
//!
//! The [`engine`] module reconciles desired quotes against live orders on
//! a single-writer executor, honoring the gate's flooding limits. Wiring
//! is by capability trait: the engine handle implements [`GateHandler`]
//! and [`BookListener`], and the gate channel implements [`OrderGateway`].
//!
//! Prices everywhere are fixed-point `u64` values scaled by 10⁹.

mod clock;
mod errors;

pub mod config;
pub mod engine;
pub mod gate;
pub mod observer;
pub mod wire;

pub use config::AppConfig;
pub use engine::{EngineConfig, FloodTracker, QuoteEngine};
pub use errors::{Error, Result};
pub use gate::{FrameSink, GateChannel, GateHandler, OrderGateway};
pub use observer::{BookEntry, BookListener, MarketObserver};
