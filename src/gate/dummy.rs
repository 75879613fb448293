//! Minimal gate server for smoke tests.
//!
//! Provides bare positive responses to session establishment, order
//! placement and order replacement, and logs everything else. Not a
//! matching engine; just enough for the agent to run without touching
//! the real exchange.

use std::collections::HashSet;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::clock::mono_nanos;
use crate::errors::{Error, Result};
use crate::wire::{read_u16, read_u64, write_u16, write_u64};

use super::frame::read_frame;
use super::{msg, SCHEMA_AND_VERSION};

/// Serves one gate session on an accepted socket until the client
/// disconnects.
///
/// # Errors
/// Fails on socket I/O errors or if the first message is not an
/// establishment request.
pub async fn serve(stream: TcpStream) -> Result<()> {
    let peer = stream.peer_addr()?;
    info!(%peer, "gate client connected");
    let (mut read_half, mut write_half) = stream.into_split();

    let request = read_frame(&mut read_half).await?;
    if read_u16(&request, 2) != msg::ESTABLISH {
        warn!(message_type = read_u16(&request, 2), "session opened with non-establish message");
        return Err(Error::Establish(request));
    }

    let mut next_seq: u64 = 1;
    let mut next_order: u64 = 1;
    let mut live_orders: HashSet<u64> = HashSet::new();

    // Acknowledge with the client's own requested heartbeat and the
    // initial sequence number.
    let mut ack = vec![0u8; 24];
    write_u16(&mut ack, 0, 16);
    write_u16(&mut ack, 2, msg::ESTABLISH_ACK);
    ack[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    ack[8..16].copy_from_slice(&request[8..16]);
    write_u64(&mut ack, 16, next_seq);
    info!("sending establishment ack");
    write_half.write_all(&ack).await?;
    write_half.flush().await?;

    loop {
        let request = match read_frame(&mut read_half).await {
            Ok(frame) => frame,
            Err(Error::TruncatedFrame) => {
                info!(%peer, "gate client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match read_u16(&request, 2) {
            msg::SEQUENCE => {
                info!("received sequence message");
            }
            msg::NEW_ORDER => {
                info!(order_id = next_order, "received new order message");
                live_orders.insert(next_order);
                let reply = order_approval(&request, next_seq, next_order);
                next_seq += 1;
                next_order += 1;
                write_half.write_all(&reply).await?;
                write_half.flush().await?;
            }
            msg::REPLACE_ORDER => {
                let old_order = read_u64(&request, 24);
                if live_orders.remove(&old_order) {
                    info!(order_id = old_order, "valid order change request");
                } else {
                    info!(order_id = old_order, "invalid order change request");
                }
                live_orders.insert(next_order);
                let reply = replace_approval(&request, next_seq, next_order);
                next_seq += 1;
                next_order += 1;
                write_half.write_all(&reply).await?;
                write_half.flush().await?;
            }
            msg::MASS_CANCEL => {
                info!("received mass cancel, clearing orders");
                live_orders.clear();
            }
            other => {
                info!(message_type = other, "ignoring message");
            }
        }
    }
}

/// Order placement report echoing the request's fields back.
fn order_approval(request: &[u8], seq: u64, order_id: u64) -> Vec<u8> {
    let mut reply = vec![0u8; 75];
    write_u16(&mut reply, 0, 67);
    write_u16(&mut reply, 2, msg::NEW_ORDER_REPORT);
    reply[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut reply, 8, seq);
    reply[16..32].copy_from_slice(&request[8..24]); // trace id + request id
    write_u64(&mut reply, 32, mono_nanos()); // timestamp
    reply[40..52].copy_from_slice(&request[24..36]); // account + instrument
    write_u64(&mut reply, 52, order_id);
    reply[60..75].copy_from_slice(&request[36..51]); // price, size, type, tif, side
    reply
}

/// Order replacement report echoing the request's fields back.
fn replace_approval(request: &[u8], seq: u64, order_id: u64) -> Vec<u8> {
    let mut reply = vec![0u8; 68];
    write_u16(&mut reply, 0, 60);
    write_u16(&mut reply, 2, msg::REPLACE_REPORT);
    reply[4..8].copy_from_slice(&SCHEMA_AND_VERSION);
    write_u64(&mut reply, 8, seq);
    reply[16..32].copy_from_slice(&request[8..24]); // trace id + request id
    write_u64(&mut reply, 32, mono_nanos()); // timestamp
    write_u64(&mut reply, 40, order_id);
    reply[48..60].copy_from_slice(&request[32..44]); // price + size
    reply[60..68].copy_from_slice(&request[24..32]); // old order id
    reply
}
