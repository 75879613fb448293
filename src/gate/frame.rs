//! Length-prefixed frame reading for the gate socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::errors::{Error, Result};

/// Receiver for raw gate frames, header included.
pub trait FrameSink: Send + Sync {
    /// Called with each complete frame as it is read off the socket.
    fn frame_received(&self, frame: Vec<u8>);
}

/// Cancellation signal shared between a reader task and its owner.
#[derive(Debug, Default)]
pub(crate) struct CancelFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    async fn cancelled(&self) {
        loop {
            // Register before checking so a cancel between the check and
            // the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Reads one frame: a 2-byte little-endian body length, six further header
/// bytes, then the body. Returns the 8-byte header and body concatenated.
///
/// End-of-stream anywhere inside a frame is a fatal read error.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(input: &mut R) -> Result<Vec<u8>> {
    let mut head = [0u8; 2];
    read_fully(input, &mut head).await?;
    let body_len = u16::from_le_bytes(head) as usize;

    let mut frame = vec![0u8; body_len + 8];
    frame[..2].copy_from_slice(&head);
    read_fully(input, &mut frame[2..]).await?;
    Ok(frame)
}

async fn read_fully<R: AsyncRead + Unpin>(input: &mut R, buf: &mut [u8]) -> Result<()> {
    input.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TruncatedFrame
        } else {
            Error::Io(e)
        }
    })?;
    Ok(())
}

/// Reader task state: drains frames off the gate socket and delivers them
/// to the registered sinks until cancelled or the stream fails.
pub(crate) struct FrameReader<R> {
    input: R,
    listeners: Vec<Arc<dyn FrameSink>>,
    cancel: Arc<CancelFlag>,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub(crate) fn new(input: R, cancel: Arc<CancelFlag>) -> Self {
        Self {
            input,
            listeners: Vec::new(),
            cancel,
        }
    }

    pub(crate) fn add_listener(&mut self, listener: Arc<dyn FrameSink>) {
        self.listeners.push(listener);
    }

    /// Reads and delivers frames until cancellation or a read error. A
    /// read error after cancellation is the expected wakeup from a socket
    /// close and exits quietly.
    pub(crate) async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("frame reader cancelled");
                    return;
                }
                read = read_frame(&mut self.input) => match read {
                    Ok(frame) => frame,
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        error!(error = %e, "gate read failed, reader exiting");
                        return;
                    }
                },
            };

            // A single listener takes the buffer by move; more than one
            // means each gets an independent copy.
            if self.listeners.len() == 1 {
                self.listeners[0].frame_received(frame);
            } else {
                for listener in &self.listeners {
                    listener.frame_received(frame.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
        notify: Notify,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                notify: Notify::new(),
            })
        }

        async fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
            loop {
                let notified = self.notify.notified();
                {
                    let frames = self.frames.lock().unwrap();
                    if frames.len() >= count {
                        return frames.clone();
                    }
                }
                notified.await;
            }
        }
    }

    impl FrameSink for Collector {
        fn frame_received(&self, frame: Vec<u8>) {
            self.frames.lock().unwrap().push(frame);
            self.notify.notify_waiters();
        }
    }

    fn frame_with_body(message_type: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; body.len() + 8];
        crate::wire::write_u16(&mut frame, 0, body.len() as u16);
        crate::wire::write_u16(&mut frame, 2, message_type);
        frame[4..8].copy_from_slice(&crate::gate::SCHEMA_AND_VERSION);
        frame[8..].copy_from_slice(body);
        frame
    }

    #[tokio::test]
    async fn test_recovers_frames_from_stream() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let collector = Collector::new();
        let mut reader = FrameReader::new(rx, Arc::new(CancelFlag::default()));
        reader.add_listener(collector.clone());
        tokio::spawn(reader.run());

        let first = frame_with_body(5007, &[0xff; 8]);
        let second = frame_with_body(7000, &[7u8; 67]);
        tx.write_all(&first).await.unwrap();
        tx.write_all(&second).await.unwrap();

        let frames = collector.wait_for(2).await;
        assert_eq!(frames[0], first);
        assert_eq!(frames[1], second);
    }

    #[tokio::test]
    async fn test_split_delivery_across_partial_writes() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let collector = Collector::new();
        let mut reader = FrameReader::new(rx, Arc::new(CancelFlag::default()));
        reader.add_listener(collector.clone());
        tokio::spawn(reader.run());

        let frame = frame_with_body(7008, &[3u8; 56]);
        tx.write_all(&frame[..5]).await.unwrap();
        tokio::task::yield_now().await;
        tx.write_all(&frame[5..]).await.unwrap();

        let frames = collector.wait_for(1).await;
        assert_eq!(frames[0], frame);
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_fatal() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tx.write_all(&[0x10, 0x00, 0x01]).await.unwrap();
        drop(tx);
        let err = read_frame(&mut rx).await.unwrap_err();
        assert!(matches!(err, Error::TruncatedFrame));
    }

    #[tokio::test]
    async fn test_cancel_exits_quietly() {
        let (tx, rx) = tokio::io::duplex(64);
        let cancel = Arc::new(CancelFlag::default());
        let mut reader = FrameReader::new(rx, cancel.clone());
        reader.add_listener(Collector::new());
        let task = tokio::spawn(reader.run());

        cancel.cancel();
        task.await.unwrap();
        drop(tx);
    }
}
