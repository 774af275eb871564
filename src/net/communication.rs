// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Communication trait and the typed wire format on top of it
//!
//! A [`Communication`] is one logical, rank-addressable channel endpoint.
//! Transports only implement connection management and raw byte transfer;
//! the typed operations are provided here so that every transport puts the
//! same frames on the wire.
//!
//! # Wire format
//!
//! Every value travels as a frame starting with a one byte [`WireTag`],
//! followed by the little-endian payload:
//!
//! ```text
//! scalar:    [tag][i32 | f64 | u8]
//! sequence:  [tag][u64 count][count * element]
//! string:    [tag][u64 length][utf-8 bytes]
//! buffer:    [tag][u64 length][bytes]
//! ```
//!
//! A frame whose tag or length differs from what the receiver asked for is a
//! protocol error.

use crate::error::{ComError, ComResult};

use super::CommType;

/// Upper bound for the element count of a received sequence
pub const MAX_SEQUENCE_LEN: u64 = 1 << 31;

/// Sequences are read in pieces of at most this many bytes, so memory only
/// grows with data that actually arrived
const RECEIVE_CHUNK: usize = 64 * 1024;

/// Frame type marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireTag {
    Int = 1,
    Double = 2,
    Bool = 3,
    String = 4,
    Ints = 5,
    Doubles = 6,
    Buffer = 7,
}

impl WireTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WireTag::Int),
            2 => Some(WireTag::Double),
            3 => Some(WireTag::Bool),
            4 => Some(WireTag::String),
            5 => Some(WireTag::Ints),
            6 => Some(WireTag::Doubles),
            7 => Some(WireTag::Buffer),
            _ => None,
        }
    }
}

/// Communication trait - a point-to-point channel to one or more remote ranks
///
/// Exactly one side of a connection accepts and the other requests. On the
/// accepting side the peers are addressed by the rank they announced while
/// connecting; on the requesting side the single peer is addressed by the
/// acceptor rank that was dialed.
///
/// All operations block. A channel is owned by one thread.
pub trait Communication: Send {
    fn comm_type(&self) -> CommType;

    fn is_connected(&self) -> bool;

    /// Remote ranks reachable through this channel, ascending
    fn remote_ranks(&self) -> Vec<i32>;

    /// Listen under the rendezvous name of `acceptor`/`requester` and accept
    /// `requester_count` connections
    ///
    /// # Arguments
    /// * `acceptor` - Name of the accepting participant
    /// * `requester` - Name of the requesting participant
    /// * `acceptor_rank` - Rank of this process in the accepting participant
    /// * `requester_count` - Number of requesting ranks to wait for
    fn accept_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_count: usize,
    ) -> ComResult<()>;

    /// Connect to `acceptor_rank` of the accepting participant
    ///
    /// Retries until the acceptor has published its address or the connect
    /// timeout of the transport elapses.
    fn request_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_rank: i32,
    ) -> ComResult<()>;

    /// Release every connection; safe to call repeatedly or before connecting
    fn close_connection(&mut self) -> ComResult<()>;

    /// Write raw bytes to `rank`
    fn send_bytes(&mut self, data: &[u8], rank: i32) -> ComResult<()>;

    /// Fill `buffer` with bytes read from `rank`
    fn receive_bytes(&mut self, buffer: &mut [u8], rank: i32) -> ComResult<()>;

    fn send_int(&mut self, value: i32, rank: i32) -> ComResult<()> {
        send_frame(self, WireTag::Int, &value.to_le_bytes(), rank)
    }

    fn receive_int(&mut self, rank: i32) -> ComResult<i32> {
        expect_tag(self, WireTag::Int, rank)?;
        let mut bytes = [0u8; 4];
        self.receive_bytes(&mut bytes, rank)?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn send_double(&mut self, value: f64, rank: i32) -> ComResult<()> {
        send_frame(self, WireTag::Double, &value.to_le_bytes(), rank)
    }

    fn receive_double(&mut self, rank: i32) -> ComResult<f64> {
        expect_tag(self, WireTag::Double, rank)?;
        let mut bytes = [0u8; 8];
        self.receive_bytes(&mut bytes, rank)?;
        Ok(f64::from_le_bytes(bytes))
    }

    fn send_bool(&mut self, value: bool, rank: i32) -> ComResult<()> {
        send_frame(self, WireTag::Bool, &[value as u8], rank)
    }

    fn receive_bool(&mut self, rank: i32) -> ComResult<bool> {
        expect_tag(self, WireTag::Bool, rank)?;
        let mut byte = [0u8; 1];
        self.receive_bytes(&mut byte, rank)?;
        match byte[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ComError::Protocol(format!(
                "invalid boolean byte {} from rank {}",
                other, rank
            ))),
        }
    }

    fn send_string(&mut self, value: &str, rank: i32) -> ComResult<()> {
        send_sized_frame(self, WireTag::String, value.len(), value.as_bytes(), rank)
    }

    fn receive_string(&mut self, rank: i32) -> ComResult<String> {
        let bytes = receive_sized_bytes(self, WireTag::String, rank)?;
        String::from_utf8(bytes).map_err(|e| {
            ComError::Protocol(format!("string from rank {} is not utf-8: {}", rank, e))
        })
    }

    fn send_ints(&mut self, values: &[i32], rank: i32) -> ComResult<()> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        send_sized_frame(self, WireTag::Ints, values.len(), &payload, rank)
    }

    fn receive_ints(&mut self, rank: i32) -> ComResult<Vec<i32>> {
        let count = receive_count(self, WireTag::Ints, rank)?;
        let mut values = Vec::with_capacity(count.min(RECEIVE_CHUNK / 4));
        read_elements(self, count, 4, rank, |bytes| values.push(decode_int(bytes)))?;
        Ok(values)
    }

    /// Receive a sequence whose length the caller already knows
    fn receive_ints_into(&mut self, values: &mut [i32], rank: i32) -> ComResult<()> {
        let count = receive_count(self, WireTag::Ints, rank)?;
        check_length(count, values.len(), rank)?;
        read_ints(self, values, rank)
    }

    fn send_doubles(&mut self, values: &[f64], rank: i32) -> ComResult<()> {
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        send_sized_frame(self, WireTag::Doubles, values.len(), &payload, rank)
    }

    fn receive_doubles(&mut self, rank: i32) -> ComResult<Vec<f64>> {
        let count = receive_count(self, WireTag::Doubles, rank)?;
        let mut values = Vec::with_capacity(count.min(RECEIVE_CHUNK / 8));
        read_elements(self, count, 8, rank, |bytes| values.push(decode_double(bytes)))?;
        Ok(values)
    }

    /// Receive a sequence whose length the caller already knows
    fn receive_doubles_into(&mut self, values: &mut [f64], rank: i32) -> ComResult<()> {
        let count = receive_count(self, WireTag::Doubles, rank)?;
        check_length(count, values.len(), rank)?;
        read_doubles(self, values, rank)
    }

    fn send_buffer(&mut self, data: &[u8], rank: i32) -> ComResult<()> {
        send_sized_frame(self, WireTag::Buffer, data.len(), data, rank)
    }

    fn receive_buffer(&mut self, rank: i32) -> ComResult<Vec<u8>> {
        receive_sized_bytes(self, WireTag::Buffer, rank)
    }
}

fn send_frame<C: Communication + ?Sized>(
    com: &mut C,
    tag: WireTag,
    payload: &[u8],
    rank: i32,
) -> ComResult<()> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(tag as u8);
    frame.extend_from_slice(payload);
    com.send_bytes(&frame, rank)
}

fn send_sized_frame<C: Communication + ?Sized>(
    com: &mut C,
    tag: WireTag,
    count: usize,
    payload: &[u8],
    rank: i32,
) -> ComResult<()> {
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.push(tag as u8);
    frame.extend_from_slice(&(count as u64).to_le_bytes());
    frame.extend_from_slice(payload);
    com.send_bytes(&frame, rank)
}

fn expect_tag<C: Communication + ?Sized>(com: &mut C, expected: WireTag, rank: i32) -> ComResult<()> {
    let mut byte = [0u8; 1];
    com.receive_bytes(&mut byte, rank)?;
    match WireTag::from_u8(byte[0]) {
        Some(tag) if tag == expected => Ok(()),
        Some(tag) => Err(ComError::Protocol(format!(
            "expected {:?} from rank {} but received {:?}",
            expected, rank, tag
        ))),
        None => Err(ComError::Protocol(format!(
            "unknown frame tag {} from rank {}",
            byte[0], rank
        ))),
    }
}

fn receive_count<C: Communication + ?Sized>(com: &mut C, tag: WireTag, rank: i32) -> ComResult<usize> {
    expect_tag(com, tag, rank)?;
    let mut bytes = [0u8; 8];
    com.receive_bytes(&mut bytes, rank)?;
    let count = u64::from_le_bytes(bytes);
    if count > MAX_SEQUENCE_LEN {
        return Err(ComError::Protocol(format!(
            "sequence of {} elements from rank {} exceeds the limit of {}",
            count, rank, MAX_SEQUENCE_LEN
        )));
    }
    Ok(count as usize)
}

fn receive_sized_bytes<C: Communication + ?Sized>(
    com: &mut C,
    tag: WireTag,
    rank: i32,
) -> ComResult<Vec<u8>> {
    let len = receive_count(com, tag, rank)?;
    let mut bytes = Vec::with_capacity(len.min(RECEIVE_CHUNK));
    while bytes.len() < len {
        let start = bytes.len();
        bytes.resize((start + RECEIVE_CHUNK).min(len), 0);
        com.receive_bytes(&mut bytes[start..], rank)?;
    }
    Ok(bytes)
}

fn check_length(received: usize, expected: usize, rank: i32) -> ComResult<()> {
    if received != expected {
        return Err(ComError::Protocol(format!(
            "expected {} elements from rank {} but the sender announced {}",
            expected, rank, received
        )));
    }
    Ok(())
}

/// Read `count` elements of `width` bytes each, one chunk at a time
fn read_elements<C, F>(com: &mut C, count: usize, width: usize, rank: i32, mut decode: F) -> ComResult<()>
where
    C: Communication + ?Sized,
    F: FnMut(&[u8]),
{
    let per_chunk = RECEIVE_CHUNK / width;
    let mut chunk = vec![0u8; count.min(per_chunk) * width];
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(per_chunk);
        let bytes = &mut chunk[..n * width];
        com.receive_bytes(bytes, rank)?;
        bytes.chunks_exact(width).for_each(&mut decode);
        remaining -= n;
    }
    Ok(())
}

fn decode_int(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn decode_double(bytes: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    f64::from_le_bytes(raw)
}

fn read_ints<C: Communication + ?Sized>(com: &mut C, values: &mut [i32], rank: i32) -> ComResult<()> {
    let mut slots = values.iter_mut();
    read_elements(com, slots.len(), 4, rank, |bytes| {
        if let Some(slot) = slots.next() {
            *slot = decode_int(bytes);
        }
    })
}

fn read_doubles<C: Communication + ?Sized>(com: &mut C, values: &mut [f64], rank: i32) -> ComResult<()> {
    let mut slots = values.iter_mut();
    read_elements(com, slots.len(), 8, rank, |bytes| {
        if let Some(slot) = slots.next() {
            *slot = decode_double(bytes);
        }
    })
}
