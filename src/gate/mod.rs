//! Client for the exchange's binary trading gate.
//!
//! The gate speaks a little-endian, length-prefixed wire protocol over a
//! long-lived TCP connection: a sequenced session layer (establish,
//! heartbeat, terminate) under an application layer of order requests and
//! reports. This module provides:
//!
//! - `channel`: session establishment, inbound dispatch, request builders
//! - `frame`: the length-prefixed frame reader
//! - `writer`: the outbound queue with idle heartbeating
//! - `handler`: the capability traits crossing the gate boundary
//! - `dummy`: a minimal gate server for smoke tests

mod channel;
pub mod dummy;
mod frame;
mod handler;
mod writer;

pub use channel::GateChannel;
pub use frame::FrameSink;
pub use handler::{GateHandler, OrderGateway};

/// Schema id and version bytes carried at offset 4 of every frame.
pub const SCHEMA_AND_VERSION: [u8; 4] = [0x04, 0x1c, 0x02, 0x00];

/// Gate message types. Session-layer types occupy 5000..=5999; everything
/// else is application layer and carries a sequence number at offset 8.
pub mod msg {
    /// Session establishment request (client).
    pub const ESTABLISH: u16 = 5000;
    /// Negotiated-heartbeat establishment ack (server).
    pub const ESTABLISH_ACK: u16 = 5001;
    /// Session terminated (server).
    pub const TERMINATE: u16 = 5003;
    /// Heartbeat / keepalive, sent by either side when idle.
    pub const SEQUENCE: u16 = 5007;
    /// Session blocked for message flooding (server).
    pub const FLOOD_REJECT: u16 = 5008;
    /// Message rejected for a non-type-specific reason (server).
    pub const MESSAGE_REJECT: u16 = 5009;
    /// Limit order placement request (client).
    pub const NEW_ORDER: u16 = 6001;
    /// Order replacement request (client).
    pub const REPLACE_ORDER: u16 = 6003;
    /// Mass cancellation request (client).
    pub const MASS_CANCEL: u16 = 6004;
    /// Order placement report (server).
    pub const NEW_ORDER_REPORT: u16 = 7000;
    /// Order placement rejection (server).
    pub const NEW_ORDER_REJECT: u16 = 7001;
    /// Order replacement report (server).
    pub const REPLACE_REPORT: u16 = 7004;
    /// Order replacement rejection (server).
    pub const REPLACE_REJECT: u16 = 7005;
    /// Execution report (server).
    pub const EXECUTION_REPORT: u16 = 7008;
}

/// Whether a message type belongs to the session layer (unsequenced).
pub(crate) fn is_session(message_type: u16) -> bool {
    (5000..=5999).contains(&message_type)
}
