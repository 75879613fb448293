//! WebSocket order book observer.
//!
//! Subscribes to the exchange's orderbook channel, maintains bid and ask
//! ladders for one instrument from snapshot and delta events, and hands
//! fixed-depth top-of-book extracts to a [`BookListener`].

mod book;

pub use book::{BookEntry, BookListener};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, trace, warn};
use tokio_tungstenite::{connect_async, tungstenite::protocol, MaybeTlsStream, WebSocketStream};

use crate::errors::{Error, Result};

use book::{scale_price, Ladder};

/// The feed drops clients that go 15 seconds without a ping; one second of
/// margin keeps scheduling jitter from causing a timeout.
const PING_PERIOD: Duration = Duration::from_secs(14);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, protocol::Message>;

/// WebSocket client tracking the order book of a single instrument.
///
/// Connection is explicit: construct, register a listener, then call
/// [`connect`](Self::connect). Cloning shares the same observer.
#[derive(Clone)]
pub struct MarketObserver {
    shared: Arc<ObserverShared>,
}

struct ObserverShared {
    endpoint: String,
    instrument: i32,
    /// Book events key the instrument by its stringified id.
    instrument_key: String,
    state: Mutex<ObserverState>,
}

struct ObserverState {
    bids: Ladder,
    asks: Ladder,
    listener: Option<Arc<dyn BookListener>>,
    depth: usize,
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    method: u32,
    params: SubscribeParams<'a>,
    id: u32,
}

#[derive(Serialize)]
struct SubscribeParams<'a> {
    channel: &'a str,
}

#[derive(Deserialize)]
struct FeedEnvelope {
    /// Present on replies to client requests, absent on push events.
    id: Option<i64>,
    result: Option<FeedResult>,
}

#[derive(Deserialize)]
struct FeedResult {
    channel: Option<String>,
    data: Option<FeedData>,
}

#[derive(Deserialize)]
struct FeedData {
    #[serde(default)]
    value: HashMap<String, BookEvent>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookEvent {
    #[serde(default)]
    is_snapshot: bool,
    #[serde(default)]
    bids: Vec<FeedLevel>,
    #[serde(default)]
    asks: Vec<FeedLevel>,
}

#[derive(Deserialize)]
struct FeedLevel {
    price: FeedPrice,
    size: i32,
}

#[derive(Deserialize)]
struct FeedPrice {
    mantissa: i64,
    #[serde(default = "default_exponent")]
    exponent: i32,
}

fn default_exponent() -> i32 {
    -9
}

impl MarketObserver {
    /// Creates an observer for `instrument` against the feed at
    /// `endpoint`. Nothing is connected until [`connect`](Self::connect).
    pub fn new(endpoint: impl Into<String>, instrument: i32) -> Self {
        Self {
            shared: Arc::new(ObserverShared {
                endpoint: endpoint.into(),
                instrument,
                instrument_key: instrument.to_string(),
                state: Mutex::new(ObserverState {
                    bids: Ladder::default(),
                    asks: Ladder::default(),
                    listener: None,
                    depth: 0,
                }),
            }),
        }
    }

    /// Registers the listener notified on book updates, replacing any
    /// previous one; `None` deregisters. The listener receives arrays of
    /// `depth` entries per side, `None`-padded when the book is shallow.
    ///
    /// # Panics
    /// If `depth` is zero while a listener is given.
    pub fn set_listener(&self, listener: Option<Arc<dyn BookListener>>, depth: usize) {
        assert!(
            depth > 0 || listener.is_none(),
            "listener depth must be positive"
        );
        let mut state = self.shared.state.lock().unwrap();
        state.listener = listener;
        state.depth = depth;
    }

    /// Opens the WebSocket, starts the ping timer and subscribes to the
    /// orderbook channel. Inbound processing runs on a spawned task until
    /// the feed closes or fails; there is no automatic reconnect.
    ///
    /// # Errors
    /// Fails if the WebSocket connection or the subscription send fails.
    pub async fn connect(&self) -> Result<()> {
        let (ws, _response) = connect_async(self.shared.endpoint.as_str())
            .await
            .map_err(|e| Error::Websocket(e.to_string()))?;
        debug!(endpoint = %self.shared.endpoint, "websocket opened");

        let (writer, mut reader) = ws.split();
        let writer = Arc::new(tokio::sync::Mutex::new(writer));

        self.spawn_ping(Arc::clone(&writer));
        self.subscribe(&writer).await?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(protocol::Message::Text(text)) => {
                        if let Err(e) = shared.process_text(&text) {
                            warn!(error = %e, "discarding unparseable feed message");
                        }
                    }
                    Ok(protocol::Message::Pong(_)) => trace!("pong received"),
                    Ok(protocol::Message::Close(frame)) => {
                        info!(?frame, "websocket closed by remote");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "websocket error");
                        break;
                    }
                }
            }
            info!("book feed reader stopped");
        });
        Ok(())
    }

    async fn subscribe(&self, writer: &Arc<tokio::sync::Mutex<WsWriter>>) -> Result<()> {
        let request = SubscribeRequest {
            method: 1,
            params: SubscribeParams {
                channel: "orderbook",
            },
            id: 1,
        };
        let payload = serde_json::to_string(&request)?;
        writer
            .lock()
            .await
            .send(protocol::Message::Text(payload))
            .await
            .map_err(|e| Error::Websocket(e.to_string()))?;
        Ok(())
    }

    fn spawn_ping(&self, writer: Arc<tokio::sync::Mutex<WsWriter>>) {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
            loop {
                ticker.tick().await;
                let mut writer = writer.lock().await;
                if let Err(e) = writer.send(protocol::Message::Ping(Vec::new())).await {
                    warn!(error = %e, "ping send failed, stopping ping timer");
                    return;
                }
                trace!("ping frame sent");
            }
        });
    }
}

impl ObserverShared {
    /// Applies one inbound text message. Events for other channels or
    /// other instruments, and replies to our own requests, are skipped.
    fn process_text(&self, raw: &str) -> Result<()> {
        let envelope: FeedEnvelope = serde_json::from_str(raw)?;
        if envelope.id.is_some() {
            // Reply to a request of ours; nothing to do.
            return Ok(());
        }
        let Some(result) = envelope.result else {
            return Ok(());
        };
        if result.channel.as_deref() != Some("orderbook") {
            return Ok(());
        }
        let Some(event) = result
            .data
            .and_then(|mut data| data.value.remove(&self.instrument_key))
        else {
            return Ok(());
        };

        trace!("updating order book");
        let (bids, asks, listener) = {
            let mut state = self.state.lock().unwrap();
            if event.is_snapshot {
                state.bids.clear();
                state.asks.clear();
            }
            for level in &event.bids {
                let price = scale_price(level.price.mantissa, level.price.exponent);
                state.bids.apply(price, level.size);
            }
            for level in &event.asks {
                let price = scale_price(level.price.mantissa, level.price.exponent);
                state.asks.apply(price, level.size);
            }

            let depth = state.depth;
            (
                state.bids.top(depth, self.instrument, true),
                state.asks.top(depth, self.instrument, false),
                state.listener.clone(),
            )
        };

        // The listener runs outside the lock so a slow consumer cannot
        // stall feed processing.
        if let Some(listener) = listener {
            listener.book_update(&bids, &asks);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recording {
        updates: Mutex<Vec<(Vec<Option<BookEntry>>, Vec<Option<BookEntry>>)>>,
    }

    impl BookListener for Recording {
        fn book_update(&self, bids: &[Option<BookEntry>], asks: &[Option<BookEntry>]) {
            self.updates
                .lock()
                .unwrap()
                .push((bids.to_vec(), asks.to_vec()));
        }
    }

    fn observer_with_listener(depth: usize) -> (MarketObserver, Arc<Recording>) {
        let observer = MarketObserver::new("ws://unused.invalid", 2);
        let recorder = Arc::new(Recording::default());
        observer.set_listener(Some(recorder.clone()), depth);
        (observer, recorder)
    }

    fn snapshot_event() -> String {
        r#"{
            "result": {
                "channel": "orderbook",
                "data": {
                    "value": {
                        "2": {
                            "isSnapshot": true,
                            "bids": [
                                {"price": {"mantissa": 99, "exponent": 0}, "size": 10},
                                {"price": {"mantissa": 98, "exponent": 0}, "size": 4}
                            ],
                            "asks": [
                                {"price": {"mantissa": 101, "exponent": 0}, "size": 6}
                            ]
                        }
                    }
                }
            }
        }"#
        .to_string()
    }

    #[test]
    fn test_snapshot_builds_book() {
        let (observer, recorder) = observer_with_listener(2);
        observer.shared.process_text(&snapshot_event()).unwrap();

        let updates = recorder.updates.lock().unwrap();
        let (bids, asks) = &updates[0];
        assert_eq!(
            bids[0],
            Some(BookEntry {
                instrument: 2,
                price: 99_000_000_000,
                amount: 10,
                buy: true
            })
        );
        assert_eq!(bids[1].unwrap().price, 98_000_000_000);
        assert_eq!(asks[0].unwrap().price, 101_000_000_000);
        assert_eq!(asks[1], None);
    }

    #[test]
    fn test_delta_updates_and_deletes_levels() {
        let (observer, recorder) = observer_with_listener(2);
        observer.shared.process_text(&snapshot_event()).unwrap();

        // Delete the best bid, grow the ask.
        let delta = r#"{
            "result": {
                "channel": "orderbook",
                "data": {
                    "value": {
                        "2": {
                            "isSnapshot": false,
                            "bids": [{"price": {"mantissa": 99, "exponent": 0}, "size": 0}],
                            "asks": [{"price": {"mantissa": 101, "exponent": 0}, "size": 9}]
                        }
                    }
                }
            }
        }"#;
        observer.shared.process_text(delta).unwrap();

        let updates = recorder.updates.lock().unwrap();
        let (bids, asks) = &updates[1];
        assert_eq!(bids[0].unwrap().price, 98_000_000_000);
        assert_eq!(bids[1], None);
        assert_eq!(asks[0].unwrap().amount, 9);
    }

    #[test]
    fn test_snapshot_resets_previous_book() {
        let (observer, recorder) = observer_with_listener(2);
        observer.shared.process_text(&snapshot_event()).unwrap();

        let fresh = r#"{
            "result": {
                "channel": "orderbook",
                "data": {
                    "value": {
                        "2": {
                            "isSnapshot": true,
                            "bids": [{"price": {"mantissa": 97, "exponent": 0}, "size": 1}],
                            "asks": [{"price": {"mantissa": 103, "exponent": 0}, "size": 1}]
                        }
                    }
                }
            }
        }"#;
        observer.shared.process_text(fresh).unwrap();

        let updates = recorder.updates.lock().unwrap();
        let (bids, _) = &updates[1];
        assert_eq!(bids[0].unwrap().price, 97_000_000_000);
        assert_eq!(bids[1], None);
    }

    #[test]
    fn test_other_instruments_and_replies_are_skipped() {
        let (observer, recorder) = observer_with_listener(2);

        // Reply to our subscription request.
        observer
            .shared
            .process_text(r#"{"id": 1, "result": {"channel": "orderbook"}}"#)
            .unwrap();
        // Another instrument entirely.
        let other = r#"{
            "result": {
                "channel": "orderbook",
                "data": {
                    "value": {
                        "7": {"isSnapshot": true, "bids": [], "asks": []}
                    }
                }
            }
        }"#;
        observer.shared.process_text(other).unwrap();
        // Another channel.
        observer
            .shared
            .process_text(r#"{"result": {"channel": "trades"}}"#)
            .unwrap();

        assert!(recorder.updates.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_listener_skips_delivery() {
        let observer = MarketObserver::new("ws://unused.invalid", 2);
        // Processing must not fail just because nobody is listening.
        observer.shared.process_text(&snapshot_event()).unwrap();
    }

    #[test]
    fn test_malformed_message_is_an_error() {
        let (observer, _) = observer_with_listener(1);
        assert!(observer.shared.process_text("not json").is_err());
    }
}
