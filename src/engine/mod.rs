//! The quoting engine.
//!
//! Keeps one buy and one sell limit order resting around the market mid,
//! re-centering them as the book and the agent's own position move. All
//! engine state lives on a single executor task that drains an unbounded
//! FIFO of events; the gate and book callbacks only enqueue. That one
//! task is the entire concurrency discipline: state is race-free without
//! locks, and events are handled in arrival order.

mod core;
mod flood;

pub use flood::FloodTracker;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

use crate::clock::mono_nanos;
use crate::gate::{GateHandler, OrderGateway};
use crate::observer::{BookEntry, BookListener};

use self::core::{EngineCore, EngineShared};

/// Scalar parameters of the quoting strategy and its safety bounds.
///
/// `interest`, `shift` and `increment` are fixed-point ×10⁹ like every
/// price in the system.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of each quote, unless position headroom is smaller.
    pub quote_volume: i32,
    /// Half-spread subtracted from / added to the mid.
    pub interest: i64,
    /// Price shift per unit of position, applied against the inventory.
    pub shift: i64,
    /// Instrument to quote.
    pub instrument: i32,
    /// Minimum price increment of the instrument.
    pub increment: i64,
    /// Position bound; the engine keeps position in `[-max, max]`.
    pub max_position: i32,
    /// Position held at startup.
    pub initial_position: i32,
    /// Gate messages per second that trigger flooding penalties.
    pub flood_limit: i32,
}

/// One unit of work for the executor task.
enum EngineEvent {
    Book {
        bids: Vec<Option<BookEntry>>,
        asks: Vec<Option<BookEntry>>,
    },
    Execution {
        order_id: u64,
        price: u64,
        filled: i32,
        remaining: i32,
    },
    Installed {
        order_id: u64,
        price: u64,
        size: i32,
        request_id: u64,
    },
    NewOrderReject {
        request_id: u64,
        reason: i8,
    },
    ReplaceReject {
        request_id: u64,
        reason: i8,
    },
    MessageReject {
        request_id: u64,
        reason: i8,
        field_id: u32,
    },
    RequestCleared {
        request_id: u64,
    },
}

/// Handle to a running quoting engine.
///
/// Implements both inbound boundaries, [`GateHandler`] for the trading
/// gate and [`BookListener`] for the market observer, by enqueuing onto
/// the executor. Clones share the engine.
#[derive(Clone)]
pub struct QuoteEngine {
    tx: UnboundedSender<EngineEvent>,
    shared: Arc<EngineShared>,
    gateway: Arc<dyn OrderGateway>,
    instrument: i32,
}

impl QuoteEngine {
    /// Starts the executor task and returns the handle to feed it.
    pub fn spawn(config: EngineConfig, gateway: Arc<dyn OrderGateway>) -> Self {
        let shared = Arc::new(EngineShared::new());
        let (tx, rx) = unbounded_channel();
        let core = EngineCore::new(&config, Arc::clone(&gateway), Arc::clone(&shared));
        tokio::spawn(run_executor(core, rx));
        Self {
            tx,
            shared,
            gateway,
            instrument: config.instrument,
        }
    }

    /// Highest request id handed out so far. The operator must seed the
    /// next run's first request id above this value.
    pub fn last_request_id(&self) -> u64 {
        self.shared.last_request_id.load(Ordering::Relaxed)
    }

    /// Stops quoting and attempts to cancel all resting orders. Safe to
    /// call from any task, any number of times; the exit hook and the
    /// failure paths race onto this without harm.
    pub fn shutdown(&self) {
        self.shared.shutdown(&*self.gateway, self.instrument);
    }

    fn enqueue(&self, event: EngineEvent) {
        if self.shared.closed.load(Ordering::Relaxed) {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!("engine executor gone, dropping event");
        }
    }
}

/// Drains engine events in arrival order. The only place engine state is
/// touched.
async fn run_executor(mut engine: EngineCore, mut rx: UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        let now = mono_nanos();
        match event {
            EngineEvent::Book { bids, asks } => engine.on_book_update(now, &bids, &asks),
            EngineEvent::Execution {
                order_id,
                price,
                filled,
                remaining,
            } => engine.on_execution(now, order_id, price, filled, remaining),
            EngineEvent::Installed {
                order_id,
                price,
                size,
                request_id,
            } => engine.on_order_installed(now, order_id, price, size, request_id),
            EngineEvent::NewOrderReject { request_id, reason } => {
                if engine.on_new_order_reject(request_id, reason) {
                    engine.shutdown();
                    std::process::exit(1);
                }
            }
            EngineEvent::ReplaceReject { request_id, reason } => {
                engine.on_replace_reject(now, request_id, reason)
            }
            EngineEvent::MessageReject {
                request_id,
                reason,
                field_id,
            } => engine.on_message_reject(request_id, reason, field_id),
            EngineEvent::RequestCleared { request_id } => engine.on_request_cleared(request_id),
        }
    }
    debug!("engine executor stopped");
}

impl GateHandler for QuoteEngine {
    fn execution_report(&self, order_id: u64, price: u64, filled: i32, remaining: i32, _timestamp: u64) {
        self.enqueue(EngineEvent::Execution {
            order_id,
            price,
            filled,
            remaining,
        });
    }

    fn new_order_report(
        &self,
        order_id: u64,
        price: u64,
        size: i32,
        _buy: bool,
        request_id: u64,
        _timestamp: u64,
    ) {
        self.enqueue(EngineEvent::Installed {
            order_id,
            price,
            size,
            request_id,
        });
    }

    fn replace_report(
        &self,
        order_id: u64,
        price: u64,
        size: i32,
        request_id: u64,
        _old_order_id: u64,
        _timestamp: u64,
    ) {
        self.enqueue(EngineEvent::Installed {
            order_id,
            price,
            size,
            request_id,
        });
    }

    fn new_order_reject(&self, request_id: u64, reason: i8) {
        self.enqueue(EngineEvent::NewOrderReject { request_id, reason });
    }

    fn replace_reject(&self, request_id: u64, reason: i8) {
        self.enqueue(EngineEvent::ReplaceReject { request_id, reason });
    }

    /// The penalty clock is set here, on the reader task, so later events
    /// already queued behind this one see the lock the moment they run.
    fn flood_reject(&self, request_id: u64, timeout_ns: u64) {
        let unlock = mono_nanos() as i64 + timeout_ns as i64;
        self.shared.unlock_time.store(unlock, Ordering::Relaxed);
        warn!(timeout_ns, "message flooding, sends blocked");
        self.enqueue(EngineEvent::RequestCleared { request_id });
    }

    fn message_reject(&self, request_id: u64, reason: i8, field_id: u32) {
        self.enqueue(EngineEvent::MessageReject {
            request_id,
            reason,
            field_id,
        });
    }

    fn terminate(&self, reason: i8) {
        error!(reason, "gate session terminated");
        self.shutdown();
        std::process::exit(1);
    }
}

impl BookListener for QuoteEngine {
    fn book_update(&self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]) {
        self.enqueue(EngineEvent::Book {
            bids: bids.to_vec(),
            asks: asks.to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        NewOrder(u64, i32, bool),
        Replace(u64, u64, i32),
        MassCancel(i32, i8),
    }

    struct RecordingGateway {
        next_request: AtomicU64,
        calls: Mutex<Vec<Call>>,
        notify: tokio::sync::Notify,
    }

    impl RecordingGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_request: AtomicU64::new(1),
                calls: Mutex::new(Vec::new()),
                notify: tokio::sync::Notify::new(),
            })
        }

        async fn wait_for_calls(&self, count: usize) -> Vec<Call> {
            loop {
                let notified = self.notify.notified();
                {
                    let calls = self.calls.lock().unwrap();
                    if calls.len() >= count {
                        return calls.clone();
                    }
                }
                tokio::time::timeout(Duration::from_secs(2), notified)
                    .await
                    .expect("gateway calls never arrived");
            }
        }

        fn push(&self, call: Call) -> u64 {
            self.calls.lock().unwrap().push(call);
            self.notify.notify_waiters();
            self.next_request.fetch_add(1, Ordering::Relaxed)
        }
    }

    impl OrderGateway for RecordingGateway {
        fn new_order(&self, price: u64, size: i32, buy: bool, _instrument: i32) -> u64 {
            self.push(Call::NewOrder(price, size, buy))
        }

        fn replace_order(&self, order_id: u64, price: u64, size: i32) -> u64 {
            self.push(Call::Replace(order_id, price, size))
        }

        fn mass_cancel(&self, instrument: i32, side: i8) -> u64 {
            self.push(Call::MassCancel(instrument, side))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            quote_volume: 10,
            interest: 500_000_000,
            shift: 0,
            instrument: 42,
            increment: 1_000_000_000,
            max_position: 50,
            initial_position: 0,
            flood_limit: 100,
        }
    }

    fn entry(price: u64, amount: i32, buy: bool) -> Option<BookEntry> {
        Some(BookEntry {
            instrument: 42,
            price,
            amount,
            buy,
        })
    }

    #[tokio::test]
    async fn test_events_flow_through_executor_in_order() {
        let gateway = RecordingGateway::new();
        let engine = QuoteEngine::spawn(config(), gateway.clone());

        // A book update produces two placements via the executor task.
        engine.book_update(
            &[entry(99_000_000_000, 5, true), None],
            &[entry(101_000_000_000, 5, false), None],
        );
        let calls = gateway.wait_for_calls(2).await;
        assert_eq!(calls[0], Call::NewOrder(100_000_000_000, 10, true));
        assert_eq!(calls[1], Call::NewOrder(101_000_000_000, 10, false));

        // Install both, then fully fill the bid: the engine requotes.
        engine.new_order_report(11, 100_000_000_000, 10, true, 1, 0);
        engine.new_order_report(12, 101_000_000_000, 10, false, 2, 0);
        engine.execution_report(11, 100_000_000_000, 10, 0, 0);
        let calls = gateway.wait_for_calls(4).await;
        assert_eq!(calls[2], Call::NewOrder(100_000_000_000, 10, true));
        assert_eq!(calls[3], Call::Replace(12, 101_000_000_000, 10));
    }

    #[tokio::test]
    async fn test_shutdown_sinkholes_later_events() {
        let gateway = RecordingGateway::new();
        let engine = QuoteEngine::spawn(config(), gateway.clone());

        engine.shutdown();
        let calls = gateway.wait_for_calls(1).await;
        assert_eq!(calls[0], Call::MassCancel(42, -1));
        assert_eq!(engine.last_request_id(), 1);

        // Enqueues after shutdown are dropped; no further traffic.
        engine.book_update(
            &[entry(99_000_000_000, 5, true), None],
            &[entry(101_000_000_000, 5, false), None],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gateway.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flood_reject_sets_penalty_clock() {
        let gateway = RecordingGateway::new();
        let engine = QuoteEngine::spawn(config(), gateway.clone());

        engine.flood_reject(99, 60_000_000_000);
        assert!(engine.shared.unlock_time.load(Ordering::Relaxed) > mono_nanos() as i64);

        // Quoting is gated while the penalty runs.
        engine.book_update(
            &[entry(99_000_000_000, 5, true), None],
            &[entry(101_000_000_000, 5, false), None],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(gateway.calls.lock().unwrap().is_empty());
    }
}
