//! Capability traits crossing the trading gate boundary.

/// Receiver for parsed gate messages dispatched by a [`GateChannel`].
///
/// One method per handled wire message. Implementations are invoked on the
/// channel's reader task and must not block; the quoting engine satisfies
/// this by enqueuing every call onto its executor.
///
/// [`GateChannel`]: super::GateChannel
pub trait GateHandler: Send + Sync {
    /// An order was executed. If `remaining > 0` the remnant is still
    /// open; if `remaining == 0` the server has purged the order.
    fn execution_report(&self, order_id: u64, price: u64, filled: i32, remaining: i32, timestamp: u64);

    /// An order was placed.
    fn new_order_report(
        &self,
        order_id: u64,
        price: u64,
        size: i32,
        buy: bool,
        request_id: u64,
        timestamp: u64,
    );

    /// An order was replaced; `order_id` identifies the replacement.
    fn replace_report(
        &self,
        order_id: u64,
        price: u64,
        size: i32,
        request_id: u64,
        old_order_id: u64,
        timestamp: u64,
    );

    /// An order placement was rejected.
    fn new_order_reject(&self, request_id: u64, reason: i8);

    /// An order replacement was rejected.
    fn replace_reject(&self, request_id: u64, reason: i8);

    /// The session is blocked for message flooding; no requests are
    /// allowed for `timeout_ns` nanoseconds.
    fn flood_reject(&self, request_id: u64, timeout_ns: u64);

    /// A request was rejected for a reason not specific to its type.
    /// `field_id` identifies the defective field when applicable.
    fn message_reject(&self, request_id: u64, reason: i8, field_id: u32);

    /// The server terminated the session.
    fn terminate(&self, reason: i8);
}

/// Outbound request surface of the trading gate.
///
/// Each call assembles one wire frame, enqueues it for transmission and
/// returns the request id it was sent under. Request ids are strictly
/// increasing across all three methods.
pub trait OrderGateway: Send + Sync {
    /// Enqueues a limit order placement (good-till-cancelled).
    fn new_order(&self, price: u64, size: i32, buy: bool, instrument: i32) -> u64;

    /// Enqueues a replacement of an existing order.
    fn replace_order(&self, order_id: u64, price: u64, size: i32) -> u64;

    /// Enqueues a mass cancellation. `side` is 1 for buys, 2 for sells;
    /// any other value cancels both sides.
    fn mass_cancel(&self, instrument: i32, side: i8) -> u64;
}
