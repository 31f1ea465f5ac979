// Inbound Stream Processing
//
// The consumer end of a cross-node stream. Decodes the producer's frames
// into the receiver registered for the stream and relays the receiver's
// drain and close requests back to the producer. The stream is always
// finished in the registry when processing ends, whatever the outcome.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::{ConsumerStatus, Message};
use crate::exec::row::Row;
use crate::flow::registry::ConnectedStream;
use crate::net::transport::InboundConn;
use crate::net::wire::{self, ConsumerSignal, ProducerFrame};

/// Serve a connected stream until the producer's trailer, the receiver
/// closing, or the consuming flow's cancellation. Rows handed to the
/// receiver are added to `rows_received` before the stream finishes.
pub fn process_inbound_stream(
    conn: &mut dyn InboundConn,
    stream: ConnectedStream,
    rows_received: &AtomicU64,
) -> Result<()> {
    let result = conn
        .send_signal(wire::encode(&ConsumerSignal::Handshake)?)
        .and_then(|_| forward_frames(conn, &stream, rows_received));

    if let Err(err) = &result {
        if err.is_canceled() {
            debug!("inbound stream {}: canceled", stream.stream_id());
        } else {
            warn!("inbound stream {} failed: {}", stream.stream_id(), err);
        }
        stream.receiver().push(Message::error(err.clone()));
        let _ = wire::encode(&ConsumerSignal::Closed).and_then(|s| conn.send_signal(s));
    }
    stream.finish();
    result
}

fn forward_frames(conn: &mut dyn InboundConn, stream: &ConnectedStream, rows_received: &AtomicU64) -> Result<()> {
    let receiver = stream.receiver();
    let mut draining = false;

    loop {
        let Some(frame) = conn.recv(stream.ctx())? else {
            return Err(FlowError::Internal(format!(
                "inbound stream {} ended without a trailer",
                stream.stream_id()
            )));
        };
        match wire::decode::<ProducerFrame>(&frame)? {
            ProducerFrame::Header { .. } => {
                return Err(FlowError::Codec("unexpected stream header".to_string()));
            }
            ProducerFrame::Data { rows, metadata } => {
                let messages = rows
                    .into_iter()
                    .map(|values| Message::Row(Row::new(values)))
                    .chain(metadata.into_iter().map(Message::Meta));
                for msg in messages {
                    if let Message::Row(_) = msg {
                        if draining {
                            continue;
                        }
                        rows_received.fetch_add(1, Ordering::Relaxed);
                    }
                    match receiver.push(msg) {
                        ConsumerStatus::NeedMoreRows => {}
                        ConsumerStatus::DrainRequested => {
                            if !draining {
                                draining = true;
                                conn.send_signal(wire::encode(&ConsumerSignal::DrainRequest)?)?;
                            }
                        }
                        ConsumerStatus::ConsumerClosed => {
                            conn.send_signal(wire::encode(&ConsumerSignal::Closed)?)?;
                            return Ok(());
                        }
                    }
                }
            }
            ProducerFrame::Trailer => return Ok(()),
        }
    }
}
