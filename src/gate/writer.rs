//! Outbound frame queue with idle heartbeating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::clock::mono_nanos;

/// Pre-built sequence frame (type 5007) used as the keepalive: an 8-byte
/// body of `0xFF`, meaning "no sequence claim, heartbeat only".
pub(crate) const SEQUENCE_FRAME: [u8; 16] = [
    0x08, 0x00, 0x8f, 0x13, 0x04, 0x1c, 0x02, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Writer task state: drains the outbound queue onto the gate socket and
/// injects a sequence frame whenever two-thirds of the heartbeat period
/// passes without a send.
pub(crate) struct OutboundWriter<W> {
    output: W,
    queue: UnboundedReceiver<Vec<u8>>,
    last_send: u64,
    heartbeat: u64,
    stopped: Arc<AtomicBool>,
}

impl<W: AsyncWrite + Unpin + Send> OutboundWriter<W> {
    /// `last_send` is the send timestamp of the establishment frame, so
    /// the first heartbeat is timed from session start.
    pub(crate) fn new(
        output: W,
        queue: UnboundedReceiver<Vec<u8>>,
        last_send: u64,
        heartbeat: u64,
        stopped: Arc<AtomicBool>,
    ) -> Self {
        Self {
            output,
            queue,
            last_send,
            heartbeat,
            stopped,
        }
    }

    /// Writes queued frames and heartbeats until stopped. Stopping does
    /// not drain the queue; frames still enqueued are dropped.
    pub(crate) async fn run(mut self) {
        loop {
            let elapsed = mono_nanos().saturating_sub(self.last_send);
            let budget_ms = (self.heartbeat * 2 / 3).saturating_sub(elapsed) / 1_000_000;
            trace!(budget_ms, "outbound poll");

            let frame = match timeout(Duration::from_millis(budget_ms), self.queue.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("outbound queue closed, writer exiting");
                    return;
                }
                Err(_) => SEQUENCE_FRAME.to_vec(),
            };

            if self.stopped.load(Ordering::Relaxed) {
                info!("outbound writer stopped");
                return;
            }

            self.last_send = mono_nanos();
            if let Err(e) = self.write_frame(&frame).await {
                warn!(error = %e, "gate write failed");
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.output.write_all(frame).await?;
        self.output.flush().await
    }
}
