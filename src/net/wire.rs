// Wire Frames
//
// Length-prefixed bincode frames exchanged over flow streams.

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::common::types::{FlowId, StreamId};
use crate::exec::error::{FlowError, Result};
use crate::exec::receiver::ProducerMetadata;
use crate::exec::row::{DataValue, Row};

/// Version stamped into every frame
pub const WIRE_VERSION: u16 = 1;

/// u16 version followed by u32 payload length
pub const FRAME_HEADER_SIZE: usize = 6;

/// Producer to consumer frames of one stream.
///
/// A stream is a `Header`, any number of `Data` frames and a `Trailer`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProducerFrame {
    Header {
        flow_id: FlowId,
        stream_id: StreamId,
    },
    Data {
        rows: Vec<Vec<DataValue>>,
        metadata: Vec<ProducerMetadata>,
    },
    Trailer,
}

impl ProducerFrame {
    pub fn data(rows: &[Row], metadata: Vec<ProducerMetadata>) -> Self {
        ProducerFrame::Data {
            rows: rows.iter().map(|r| r.values().to_vec()).collect(),
            metadata,
        }
    }
}

/// Consumer to producer signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsumerSignal {
    /// The consumer side found the flow and is ready for data
    Handshake,
    /// Stop sending rows; metadata is still wanted
    DrainRequest,
    /// Nothing more will be read
    Closed,
}

/// Encode a message into a framed buffer
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| FlowError::Codec(format!("frame of {} bytes is too large", payload.len())))?;

    let mut buf = vec![0u8; FRAME_HEADER_SIZE + payload.len()];
    LittleEndian::write_u16(&mut buf[0..2], WIRE_VERSION);
    LittleEndian::write_u32(&mut buf[2..6], len);
    buf[FRAME_HEADER_SIZE..].copy_from_slice(&payload);
    Ok(buf)
}

/// Decode a framed buffer produced by `encode`
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(FlowError::Codec(format!("short frame: {} bytes", buf.len())));
    }
    let version = LittleEndian::read_u16(&buf[0..2]);
    if version != WIRE_VERSION {
        return Err(FlowError::Codec(format!(
            "unsupported wire version {} (expected {})",
            version, WIRE_VERSION
        )));
    }
    let len = LittleEndian::read_u32(&buf[2..6]) as usize;
    let payload = &buf[FRAME_HEADER_SIZE..];
    if payload.len() != len {
        return Err(FlowError::Codec(format!(
            "frame length mismatch: header says {}, got {}",
            len,
            payload.len()
        )));
    }
    Ok(bincode::deserialize(payload)?)
}
