//! Trading gate session: establishment, inbound dispatch, request builders.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::mono_nanos;
use crate::errors::{Error, Result};
use crate::wire::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64};

use super::frame::{CancelFlag, FrameReader, FrameSink};
use super::handler::{GateHandler, OrderGateway};
use super::writer::OutboundWriter;
use super::{is_session, msg, SCHEMA_AND_VERSION};

/// Heartbeat period requested at session establishment, in nanoseconds.
/// The server answers with the period it actually enforces.
const REQUEST_HEARTBEAT_NS: u64 = 5_000_000_000;

/// Connection to a trading gate.
///
/// Parses information from raw frames as they arrive and passes it to a
/// [`GateHandler`]; assembles and enqueues outbound request frames. Only
/// the message subset needed for single limit order quoting is handled;
/// unhandled inbound messages are logged and ignored.
///
/// Cloning is cheap and clones share the underlying session.
#[derive(Clone)]
pub struct GateChannel {
    shared: Arc<ChannelShared>,
}

struct ChannelShared {
    host: String,
    port: u16,
    login: u32,
    account: i64,
    /// Next outbound request id. Must start greater than any id used in a
    /// previous session or the gate rejects the requests.
    request: Mutex<u64>,
    /// Next expected inbound sequence number.
    sequence: Mutex<u64>,
    handler: Mutex<Option<Arc<dyn GateHandler>>>,
    out_tx: UnboundedSender<Vec<u8>>,
    out_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>>,
    heartbeat: AtomicU64,
    writer_stop: Arc<AtomicBool>,
    reader_cancel: Arc<CancelFlag>,
    connected: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GateChannel {
    /// Creates a channel. No connection is attempted until
    /// [`connect`](Self::connect) is called.
    ///
    /// `first_request_id` must be greater than any request id used in a
    /// previous run under the same login.
    pub fn new(host: impl Into<String>, port: u16, login: u32, account: i64, first_request_id: u64) -> Self {
        let (out_tx, out_rx) = unbounded_channel();
        Self {
            shared: Arc::new(ChannelShared {
                host: host.into(),
                port,
                login,
                account,
                request: Mutex::new(first_request_id),
                sequence: Mutex::new(0),
                handler: Mutex::new(None),
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                heartbeat: AtomicU64::new(0),
                writer_stop: Arc::new(AtomicBool::new(false)),
                reader_cancel: Arc::new(CancelFlag::default()),
                connected: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Sets the handler that receives parsed inbound messages. May be
    /// called before or after `connect`; frames arriving with no handler
    /// installed are logged and dropped.
    pub fn set_handler(&self, handler: Arc<dyn GateHandler>) {
        *self.shared.handler.lock().unwrap() = Some(handler);
    }

    /// Heartbeat period negotiated by the server, in nanoseconds. Zero
    /// until a session is established.
    pub fn negotiated_heartbeat(&self) -> u64 {
        self.shared.heartbeat.load(Ordering::Relaxed)
    }

    /// Connects to the gate and establishes a session, then starts the
    /// reader and writer workers.
    ///
    /// # Errors
    /// Fails on socket I/O errors and on any establishment response other
    /// than a negotiated-heartbeat message.
    pub async fn connect(&self) -> Result<()> {
        if self.shared.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }

        info!(host = %self.shared.host, port = self.shared.port, "connecting to trading gate");
        let stream = TcpStream::connect((self.shared.host.as_str(), self.shared.port)).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let last_send = mono_nanos();
        let establish = build_establish(self.shared.login);
        write_half.write_all(&establish).await?;
        write_half.flush().await?;
        debug!("establish sent, awaiting acknowledgement");

        // The response is 24 bytes; its length field is not trusted (live
        // gates have been seen declaring less than they send).
        let mut ack = [0u8; 24];
        read_half.read_exact(&mut ack[..8]).await?;
        if read_u16(&ack, 2) != msg::ESTABLISH_ACK {
            return Err(Error::Establish(ack[..8].to_vec()));
        }
        read_half.read_exact(&mut ack[8..]).await?;

        let heartbeat = read_u64(&ack, 8);
        *self.shared.sequence.lock().unwrap() = read_u64(&ack, 16);
        self.shared.heartbeat.store(heartbeat, Ordering::Relaxed);
        info!(heartbeat_ns = heartbeat, "session established");

        let queue = self
            .shared
            .out_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::AlreadyConnected)?;
        let writer = OutboundWriter::new(
            write_half,
            queue,
            last_send,
            heartbeat,
            Arc::clone(&self.shared.writer_stop),
        );
        let mut reader = FrameReader::new(read_half, Arc::clone(&self.shared.reader_cancel));
        reader.add_listener(Arc::new(ChannelFrameSink {
            shared: Arc::clone(&self.shared),
        }));

        let mut workers = self.shared.workers.lock().unwrap();
        workers.push(tokio::spawn(writer.run()));
        workers.push(tokio::spawn(reader.run()));
        Ok(())
    }

    /// Stops both workers and lets the socket close. No session-layer
    /// goodbye is sent; replies still in flight may be lost. The server's
    /// mass cancel is the safety mechanism, not a graceful tear-down.
    pub fn close(&self) {
        info!("closing gate connection");
        self.shared.writer_stop.store(true, Ordering::Relaxed);
        self.shared.reader_cancel.cancel();
    }

    fn next_request_id(&self) -> u64 {
        let mut request = self.shared.request.lock().unwrap();
        let id = *request;
        *request += 1;
        id
    }

    fn enqueue(&self, frame: Vec<u8>) {
        if self.shared.out_tx.send(frame).is_err() {
            debug!("outbound queue closed, dropping frame");
        }
    }

    /// Sends a limit order placement request and returns its request id.
    pub fn send_new_order_single(&self, price: u64, size: i32, buy: bool, instrument: i32) -> u64 {
        let request_id = self.next_request_id();
        self.enqueue(build_new_order(
            request_id,
            self.shared.account,
            instrument,
            price,
            size,
            buy,
        ));
        request_id
    }

    /// Sends an order replacement request and returns its request id.
    pub fn send_order_replace_request(&self, order_id: u64, price: u64, size: i32) -> u64 {
        let request_id = self.next_request_id();
        self.enqueue(build_replace_order(request_id, order_id, price, size));
        request_id
    }

    /// Sends a mass cancellation request and returns its request id.
    /// Replies to this message type are not dispatched; use sparingly.
    pub fn send_order_mass_cancel_request(&self, instrument: i32, side: i8) -> u64 {
        let request_id = self.next_request_id();
        self.enqueue(build_mass_cancel(
            request_id,
            self.shared.account,
            instrument,
            side,
        ));
        request_id
    }
}

impl OrderGateway for GateChannel {
    fn new_order(&self, price: u64, size: i32, buy: bool, instrument: i32) -> u64 {
        self.send_new_order_single(price, size, buy, instrument)
    }

    fn replace_order(&self, order_id: u64, price: u64, size: i32) -> u64 {
        self.send_order_replace_request(order_id, price, size)
    }

    fn mass_cancel(&self, instrument: i32, side: i8) -> u64 {
        self.send_order_mass_cancel_request(instrument, side)
    }
}

/// Adapter handing raw frames from the reader task to the dispatcher.
struct ChannelFrameSink {
    shared: Arc<ChannelShared>,
}

impl FrameSink for ChannelFrameSink {
    fn frame_received(&self, frame: Vec<u8>) {
        self.shared.dispatch_frame(&frame);
    }
}

impl ChannelShared {
    /// Parses a frame, enforces sequence discipline and routes the typed
    /// contents to the handler.
    fn dispatch_frame(&self, frame: &[u8]) {
        trace!(len = frame.len(), "frame received");
        if frame.len() < 8 {
            warn!(len = frame.len(), "runt frame dropped");
            return;
        }
        let message_type = read_u16(frame, 2);

        // Application-layer messages all carry their sequence number at
        // offset 8. A gap is logged without advancing the expectation; the
        // channel stays out of step until an operator intervenes.
        let expected_seq;
        {
            let mut sequence = self.sequence.lock().unwrap();
            if !is_session(message_type) {
                if frame.len() >= 16 && read_u64(frame, 8) != *sequence {
                    warn!(
                        received = read_u64(frame, 8),
                        expected = *sequence,
                        "sequencing problem"
                    );
                } else if frame.len() < 16 {
                    warn!(message_type, len = frame.len(), "anomalous message");
                } else {
                    *sequence += 1;
                }
            }
            expected_seq = *sequence;
        }
        let handler = self.handler.lock().unwrap().clone();

        match message_type {
            msg::NEW_ORDER_REPORT => {
                let Some(handler) = require(handler, frame, 75, "order placement") else {
                    return;
                };
                handler.new_order_report(
                    read_u64(frame, 52),
                    read_u64(frame, 60),
                    read_u32(frame, 68) as i32,
                    frame[74] == 1,
                    read_u64(frame, 24),
                    read_u64(frame, 32),
                );
            }
            msg::NEW_ORDER_REJECT => {
                let Some(handler) = require(handler, frame, 33, "order rejection") else {
                    return;
                };
                handler.new_order_reject(read_u64(frame, 24), frame[32] as i8);
            }
            msg::EXECUTION_REPORT => {
                let Some(handler) = require(handler, frame, 64, "execution report") else {
                    return;
                };
                handler.execution_report(
                    read_u64(frame, 52),
                    read_u64(frame, 40),
                    read_u32(frame, 48) as i32,
                    read_u32(frame, 60) as i32,
                    read_u64(frame, 24),
                );
            }
            msg::REPLACE_REPORT => {
                let Some(handler) = require(handler, frame, 68, "order replacement") else {
                    return;
                };
                handler.replace_report(
                    read_u64(frame, 40),
                    read_u64(frame, 48),
                    read_u32(frame, 56) as i32,
                    read_u64(frame, 24),
                    read_u64(frame, 60),
                    read_u64(frame, 32),
                );
            }
            msg::REPLACE_REJECT => {
                let Some(handler) = require(handler, frame, 33, "replacement rejection") else {
                    return;
                };
                handler.replace_reject(read_u64(frame, 24), frame[32] as i8);
            }
            msg::TERMINATE => {
                if frame.len() < 9 {
                    warn!(len = frame.len(), "short terminate frame");
                    return;
                }
                match handler {
                    Some(handler) => handler.terminate(frame[8] as i8),
                    None => error!(reason = frame[8] as i8, "session terminated, no handler"),
                }
            }
            msg::SEQUENCE => {
                if frame.len() >= 16 && read_u64(frame, 8) != expected_seq {
                    warn!(
                        received = read_u64(frame, 8),
                        expected = expected_seq,
                        "heartbeat sequence number disagrees"
                    );
                }
            }
            msg::FLOOD_REJECT => {
                let Some(handler) = require(handler, frame, 28, "flood rejection") else {
                    return;
                };
                handler.flood_reject(read_u64(frame, 8), read_u64(frame, 20));
            }
            msg::MESSAGE_REJECT => {
                let Some(handler) = require(handler, frame, 21, "message rejection") else {
                    return;
                };
                handler.message_reject(read_u64(frame, 8), frame[20] as i8, read_u32(frame, 16));
            }
            other => {
                debug!(message_type = other, "unhandled message received");
            }
        }
    }
}

/// Checks a handler is installed and the frame covers every parsed field.
fn require(
    handler: Option<Arc<dyn GateHandler>>,
    frame: &[u8],
    min_len: usize,
    what: &str,
) -> Option<Arc<dyn GateHandler>> {
    if frame.len() < min_len {
        warn!(len = frame.len(), min_len, "short {what} message dropped");
        return None;
    }
    if handler.is_none() {
        warn!("no handler for {what} message");
    }
    handler
}

fn build_establish(login: u32) -> Vec<u8> {
    let mut frame = vec![0u8; 20];
    write_u16(&mut frame, 0, 12);
    write_u16(&mut frame, 2, msg::ESTABLISH);
    frame[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut frame, 8, REQUEST_HEARTBEAT_NS);
    write_u32(&mut frame, 16, login);
    frame
}

fn build_new_order(
    request_id: u64,
    account: i64,
    instrument: i32,
    price: u64,
    size: i32,
    buy: bool,
) -> Vec<u8> {
    let mut frame = vec![0u8; 51];
    write_u16(&mut frame, 0, 43);
    write_u16(&mut frame, 2, msg::NEW_ORDER);
    frame[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut frame, 8, -1i64 as u64); // TraceID, null
    write_u64(&mut frame, 16, request_id);
    write_u64(&mut frame, 24, account as u64);
    write_u32(&mut frame, 32, instrument as u32);
    write_u64(&mut frame, 36, price);
    write_u32(&mut frame, 44, size as u32);
    frame[48] = 1; // order type: limit
    frame[49] = 1; // time in force: good till cancelled
    frame[50] = if buy { 1 } else { 2 };
    frame
}

fn build_replace_order(request_id: u64, order_id: u64, price: u64, size: i32) -> Vec<u8> {
    let mut frame = vec![0u8; 46];
    write_u16(&mut frame, 0, 38);
    write_u16(&mut frame, 2, msg::REPLACE_ORDER);
    frame[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut frame, 8, -1i64 as u64); // TraceID, null
    write_u64(&mut frame, 16, request_id);
    write_u64(&mut frame, 24, order_id);
    write_u64(&mut frame, 32, price);
    write_u32(&mut frame, 40, size as u32);
    frame[44] = 0xff; // order type: null
    frame[45] = 0xff; // time in force: null
    frame
}

fn build_mass_cancel(request_id: u64, account: i64, instrument: i32, side: i8) -> Vec<u8> {
    let mut frame = vec![0u8; 37];
    write_u16(&mut frame, 0, 29);
    write_u16(&mut frame, 2, msg::MASS_CANCEL);
    frame[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut frame, 8, -1i64 as u64); // TraceID, null
    write_u64(&mut frame, 16, request_id);
    write_u64(&mut frame, 24, account as u64);
    write_u32(&mut frame, 32, instrument as u32);
    frame[36] = if side == 1 || side == 2 { side as u8 } else { 0xff };
    frame
}
