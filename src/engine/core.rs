//! Quoting state machine.
//!
//! All methods here run on the engine's executor task; nothing in this
//! module is shared or locked except the two atomics the rest of the
//! process also reads (`unlock_time`, `last_request_id`).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::gate::OrderGateway;
use crate::observer::BookEntry;

use super::flood::FloodTracker;
use super::EngineConfig;

/// State shared between the executor task and the engine handle: the
/// flood-penalty clock, the highest request id ever used, and the flag
/// that sinkholes enqueues after shutdown.
#[derive(Debug)]
pub(crate) struct EngineShared {
    /// Monotonic-nanos time before which no requests may be sent.
    /// `i64::MAX` once a shutdown path has run.
    pub(crate) unlock_time: AtomicI64,
    /// Highest request id handed out so far; the operator needs this to
    /// seed the next run.
    pub(crate) last_request_id: AtomicU64,
    pub(crate) closed: AtomicBool,
}

impl EngineShared {
    pub(crate) fn new() -> Self {
        Self {
            unlock_time: AtomicI64::new(0),
            last_request_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Stops quoting and attempts to cancel all resting orders. Reached
    /// from the fatal-reject path, the terminate path and the process
    /// exit hook; every path sinkholes further sends, so racing
    /// invocations are harmless.
    pub(crate) fn shutdown(&self, gateway: &dyn OrderGateway, instrument: i32) {
        self.closed.store(true, Ordering::Relaxed);
        self.unlock_time.store(i64::MAX, Ordering::Relaxed);
        let request_id = gateway.mass_cancel(instrument, -1);
        let last = self
            .last_request_id
            .fetch_max(request_id, Ordering::Relaxed)
            .max(request_id);
        info!(last_request_id = last, "last used request id");
    }
}

/// The quoting decision state: live orders, desired quotes, market prices
/// and the flood window. Owned exclusively by the executor task.
pub(crate) struct EngineCore {
    standard_volume: i32,
    interest: i64,
    shift: i64,
    instrument: i32,
    max_position: i32,
    increment: i64,

    position: i32,

    gateway: Arc<dyn OrderGateway>,
    shared: Arc<EngineShared>,
    flood: FloodTracker,

    bid_price: u64,
    bid_amount: i32,
    ask_price: u64,
    ask_amount: i32,

    market_bid: u64,
    market_ask: u64,

    bid_id: u64,
    ask_id: u64,

    bid_request: u64,
    ask_request: u64,

    desired_bid_price: u64,
    desired_bid_amount: i32,
    desired_ask_price: u64,
    desired_ask_amount: i32,

    revision_pending: bool,
}

/// Rounds to the nearest multiple of `increment`; a remainder of exactly
/// half an increment rounds up.
fn round_to_increment(price: i64, increment: i64) -> i64 {
    let remainder = price % increment;
    price - remainder + if remainder < increment / 2 { 0 } else { increment }
}

impl EngineCore {
    pub(crate) fn new(
        config: &EngineConfig,
        gateway: Arc<dyn OrderGateway>,
        shared: Arc<EngineShared>,
    ) -> Self {
        Self {
            standard_volume: config.quote_volume,
            interest: config.interest,
            shift: config.shift,
            instrument: config.instrument,
            max_position: config.max_position,
            increment: config.increment,
            position: config.initial_position,
            gateway,
            shared,
            // The tracker stays one event short of the gate's limit so a
            // heartbeat or a racing request cannot tip the session over.
            flood: FloodTracker::new(config.flood_limit.max(2) as usize - 1, 1_000_000_000),
            bid_price: 0,
            bid_amount: 0,
            ask_price: 0,
            ask_amount: 0,
            market_bid: 0,
            market_ask: 0,
            bid_id: 0,
            ask_id: 0,
            bid_request: 0,
            ask_request: 0,
            desired_bid_price: 0,
            desired_bid_amount: 0,
            desired_ask_price: 0,
            desired_ask_amount: 0,
            revision_pending: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn position(&self) -> i32 {
        self.position
    }

    fn record_request(&self, request_id: u64) {
        self.shared
            .last_request_id
            .fetch_max(request_id, Ordering::Relaxed);
    }

    fn locked(&self, now: u64) -> bool {
        (now as i64) < self.shared.unlock_time.load(Ordering::Relaxed)
    }

    /// Book update: finds the best prices that are not the agent's own
    /// resting orders and requotes when either side moved.
    pub(crate) fn on_book_update(
        &mut self,
        now: u64,
        bids: &[Option<BookEntry>],
        asks: &[Option<BookEntry>],
    ) {
        // If the top entry is at our live price with no more size than our
        // own order, it is (at best) just us; look one level deeper.
        let mut top_bid = bids.first().copied().flatten();
        if let Some(entry) = top_bid {
            if entry.price == self.bid_price && entry.amount <= self.bid_amount {
                top_bid = bids.get(1).copied().flatten();
            }
        }
        let mut top_ask = asks.first().copied().flatten();
        if let Some(entry) = top_ask {
            if entry.price == self.ask_price && entry.amount <= self.ask_amount {
                top_ask = asks.get(1).copied().flatten();
            }
        }

        if let (Some(bid), Some(ask)) = (top_bid, top_ask) {
            if ask.price != self.market_ask || bid.price != self.market_bid {
                debug!(
                    old_ask = self.market_ask,
                    new_ask = ask.price,
                    old_bid = self.market_bid,
                    new_bid = bid.price,
                    "market prices updated"
                );
                self.market_ask = ask.price;
                self.market_bid = bid.price;
                self.replace_orders(now);
            }
        }
    }

    /// Execution report: adjusts position and the live order's remainder,
    /// and requotes once an order has entirely cleared.
    pub(crate) fn on_execution(
        &mut self,
        now: u64,
        order_id: u64,
        price: u64,
        filled: i32,
        remaining: i32,
    ) {
        if order_id == self.bid_id {
            self.bid_amount = remaining;
            self.position += filled;
            info!(size = filled, price, remaining, "bought");
        } else if order_id == self.ask_id {
            self.ask_amount = remaining;
            self.position -= filled;
            info!(size = filled, price, remaining, "sold");
        } else {
            error!(
                order_id,
                bid_id = self.bid_id,
                ask_id = self.ask_id,
                "unrecognized order execution; position record is now in error"
            );
        }

        if remaining == 0 {
            self.replace_orders(now);
        }
    }

    /// Placement or replacement report: installs the order on whichever
    /// side its request id belongs to and releases that side's in-flight
    /// slot.
    pub(crate) fn on_order_installed(
        &mut self,
        now: u64,
        order_id: u64,
        price: u64,
        size: i32,
        request_id: u64,
    ) {
        if request_id == self.bid_request {
            self.bid_id = order_id;
            self.bid_price = price;
            self.bid_amount = size;
            self.bid_request = 0;
            debug!(order_id, "installed new buy order");
        } else if request_id == self.ask_request {
            self.ask_id = order_id;
            self.ask_price = price;
            self.ask_amount = size;
            self.ask_request = 0;
            debug!(order_id, "installed new sell order");
        } else {
            warn!(
                request_id,
                bid_request = self.bid_request,
                ask_request = self.ask_request,
                "unidentified order report received"
            );
        }

        if self.ask_request == 0 && self.bid_request == 0 && self.revision_pending {
            self.dispatch(now);
        }
    }

    /// Replacement rejection. Reason 4 is the expected "order no longer
    /// exists" race; if a quote is still wanted on that side and the
    /// flood window allows, a fresh placement goes out in its stead.
    pub(crate) fn on_replace_reject(&mut self, now: u64, request_id: u64, reason: i8) {
        if request_id == self.bid_request {
            if self.desired_bid_amount == 0 {
                debug!("failed bid replacement, no bid now desired");
                self.bid_request = 0;
            } else if self.locked(now) || !self.flood.add(now) {
                debug!("failed bid replacement, flood penalty blocks a new order");
                self.bid_request = 0;
            } else {
                debug!("failed bid replacement, placing new order");
                self.bid_request = self.gateway.new_order(
                    self.desired_bid_price,
                    self.desired_bid_amount,
                    true,
                    self.instrument,
                );
                self.record_request(self.bid_request);
            }
        } else if request_id == self.ask_request {
            if self.desired_ask_amount == 0 {
                debug!("failed ask replacement, no ask now desired");
                self.ask_request = 0;
            } else if self.locked(now) || !self.flood.add(now) {
                debug!("failed ask replacement, flood penalty blocks a new order");
                self.ask_request = 0;
            } else {
                debug!("failed ask replacement, placing new order");
                self.ask_request = self.gateway.new_order(
                    self.desired_ask_price,
                    self.desired_ask_amount,
                    false,
                    self.instrument,
                );
                self.record_request(self.ask_request);
            }
        } else {
            warn!(
                request_id,
                bid_request = self.bid_request,
                ask_request = self.ask_request,
                "unidentified replacement rejection received"
            );
        }

        if reason != 4 {
            warn!(reason, "order replacement failed with unexpected reason code");
        }
    }

    /// Placement rejection. Returns `true` when the reason code means the
    /// session is not worth continuing (the caller shuts down and exits).
    #[must_use]
    pub(crate) fn on_new_order_reject(&mut self, request_id: u64, reason: i8) -> bool {
        error!(request_id, reason, "order rejected");
        self.clear_request(request_id);
        let fatal = matches!(reason, 2 | 3 | 13);
        if fatal {
            error!("order rejection indicates irrecoverable error");
        }
        fatal
    }

    pub(crate) fn on_message_reject(&mut self, request_id: u64, reason: i8, field_id: u32) {
        error!(request_id, reason, field_id, "message rejected");
        self.clear_request(request_id);
    }

    /// Releases the request slot held by a flood-rejected request. The
    /// penalty clock itself was already set when the rejection arrived.
    pub(crate) fn on_request_cleared(&mut self, request_id: u64) {
        self.clear_request(request_id);
    }

    fn clear_request(&mut self, request_id: u64) {
        self.record_request(request_id);
        if request_id == self.bid_request {
            self.bid_request = 0;
        } else if request_id == self.ask_request {
            self.ask_request = 0;
        } else {
            warn!(request_id, "request cleared but not recognized");
        }
    }

    /// Recomputes desired quotes from the market mid, the interest margin
    /// and the position-proportional shift, then dispatches if both sides
    /// are idle and no flood penalty is pending.
    ///
    /// Desired prices must land on a multiple of the instrument's price
    /// increment or the gate rejects the orders.
    pub(crate) fn replace_orders(&mut self, now: u64) {
        // Unsigned midpoint: the sum may wrap the signed range.
        let mid = self.market_ask.wrapping_add(self.market_bid) / 2;
        let position_adjust = self.shift.wrapping_mul(self.position as i64);

        self.desired_bid_amount = (self.max_position - self.position).min(self.standard_volume);
        self.desired_bid_price =
            round_to_increment(mid as i64 - self.interest - position_adjust, self.increment) as u64;
        // The floor is -max_position, so headroom on the ask side is
        // position + max_position.
        self.desired_ask_amount = (self.position + self.max_position).min(self.standard_volume);
        self.desired_ask_price =
            round_to_increment(mid as i64 + self.interest - position_adjust, self.increment) as u64;

        if self.ask_request == 0 && self.bid_request == 0 && !self.locked(now) {
            self.dispatch(now);
        } else {
            self.revision_pending = true;
        }
    }

    /// Sends the desired quotes: a replacement where a live order exists,
    /// a fresh placement otherwise. Only runs when the flood window can
    /// absorb the whole batch.
    fn dispatch(&mut self, now: u64) {
        let wanted = usize::from(self.desired_bid_amount > 0) + usize::from(self.desired_ask_amount > 0);
        if self.flood.available(now) > wanted {
            if self.desired_bid_amount > 0 {
                self.flood.add(now);
                if self.bid_amount > 0 {
                    debug!(price = self.desired_bid_price, "sending buy replacement request");
                    self.bid_request = self.gateway.replace_order(
                        self.bid_id,
                        self.desired_bid_price,
                        self.desired_bid_amount,
                    );
                } else {
                    debug!(price = self.desired_bid_price, "sending new buy order request");
                    self.bid_request = self.gateway.new_order(
                        self.desired_bid_price,
                        self.desired_bid_amount,
                        true,
                        self.instrument,
                    );
                }
            }

            if self.desired_ask_amount > 0 {
                self.flood.add(now);
                if self.ask_amount > 0 {
                    debug!(price = self.desired_ask_price, "sending sell replacement request");
                    self.ask_request = self.gateway.replace_order(
                        self.ask_id,
                        self.desired_ask_price,
                        self.desired_ask_amount,
                    );
                } else {
                    debug!(price = self.desired_ask_price, "sending new sell order request");
                    self.ask_request = self.gateway.new_order(
                        self.desired_ask_price,
                        self.desired_ask_amount,
                        false,
                        self.instrument,
                    );
                }
            }

            self.record_request(self.bid_request.max(self.ask_request));
            self.revision_pending = false;
        } else {
            debug!("order dispatch prevented by flood limiter");
        }
    }

    /// Stops quoting and cancels all resting orders.
    pub(crate) fn shutdown(&mut self) {
        self.shared.shutdown(&*self.gateway, self.instrument);
    }
}
