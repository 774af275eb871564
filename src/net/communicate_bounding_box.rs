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

//! Exchange of partition metadata over a communication
//!
//! A box is sent as `min, max` of dimension 0, then dimension 1, and so on;
//! the dimensionality is agreed beforehand and never sent. Maps are sent as
//! their entry count followed by `(rank, value)` in ascending rank order.
//! The receiver names the keys it expects by pre-populating the destination
//! map, and every expected key must arrive exactly once. Receives work on a
//! copy, so a failed receive never leaves a half-written destination behind.

use std::collections::{BTreeMap, BTreeSet};

use crate::bounding_box::{BoundingBox, BoundingBoxMap, ConnectionMap};
use crate::error::{ComError, ComResult};

use super::Communication;

/// Bounding box protocol on top of a borrowed channel
pub struct CommunicateBoundingBox<'a> {
    communication: &'a mut dyn Communication,
}

impl<'a> CommunicateBoundingBox<'a> {
    pub fn new(communication: &'a mut dyn Communication) -> Self {
        Self { communication }
    }

    pub fn send_bounding_box(&mut self, bb: &BoundingBox, rank: i32) -> ComResult<()> {
        for (min, max) in bb.pairs() {
            self.communication.send_double(*min, rank)?;
            self.communication.send_double(*max, rank)?;
        }
        Ok(())
    }

    /// Receive into `bb`, whose dimensionality decides how much is read
    pub fn receive_bounding_box(&mut self, bb: &mut BoundingBox, rank: i32) -> ComResult<()> {
        let mut received = bb.clone();
        self.read_box(&mut received, rank)?;
        *bb = received;
        Ok(())
    }

    pub fn send_bounding_box_map(&mut self, bbm: &BoundingBoxMap, rank: i32) -> ComResult<()> {
        self.communication.send_int(map_len(bbm.len())?, rank)?;
        for (key, bb) in bbm {
            self.communication.send_int(*key, rank)?;
            self.send_bounding_box(bb, rank)?;
        }
        log::debug!("Sent {} bounding boxes to rank {}", bbm.len(), rank);
        Ok(())
    }

    /// Fill the boxes of the keys already present in `bbm`
    pub fn receive_bounding_box_map(&mut self, bbm: &mut BoundingBoxMap, rank: i32) -> ComResult<()> {
        let count = self.communication.receive_int(rank)?;
        check_count(count, bbm.len(), rank)?;

        let mut received = bbm.clone();
        let mut filled = BTreeSet::new();
        for _ in 0..count {
            let key = self.communication.receive_int(rank)?;
            let bb = slot(&mut received, &mut filled, key, rank)?;
            self.read_box(bb, rank)?;
        }
        *bbm = received;
        log::debug!("Received {} bounding boxes from rank {}", count, rank);
        Ok(())
    }

    pub fn send_connection_map(&mut self, cm: &ConnectionMap, rank: i32) -> ComResult<()> {
        self.communication.send_int(map_len(cm.len())?, rank)?;
        for (key, partners) in cm {
            self.communication.send_int(*key, rank)?;
            self.communication.send_ints(partners, rank)?;
        }
        Ok(())
    }

    /// Fill the partner lists of the keys already present in `cm`
    pub fn receive_connection_map(&mut self, cm: &mut ConnectionMap, rank: i32) -> ComResult<()> {
        let count = self.communication.receive_int(rank)?;
        check_count(count, cm.len(), rank)?;

        let mut received = cm.clone();
        let mut filled = BTreeSet::new();
        for _ in 0..count {
            let key = self.communication.receive_int(rank)?;
            let partners = self.communication.receive_ints(rank)?;
            *slot(&mut received, &mut filled, key, rank)? = partners;
        }
        *cm = received;
        Ok(())
    }

    fn read_box(&mut self, bb: &mut BoundingBox, rank: i32) -> ComResult<()> {
        for pair in bb.pairs_mut() {
            pair.0 = self.communication.receive_double(rank)?;
            pair.1 = self.communication.receive_double(rank)?;
        }
        Ok(())
    }
}

fn map_len(len: usize) -> ComResult<i32> {
    i32::try_from(len)
        .map_err(|_| ComError::Protocol(format!("map with {} entries is too large to send", len)))
}

fn check_count(received: i32, expected: usize, rank: i32) -> ComResult<()> {
    if received < 0 || received as usize != expected {
        return Err(ComError::Protocol(format!(
            "rank {} sent {} entries, {} were expected",
            rank, received, expected
        )));
    }
    Ok(())
}

/// Entry of `key` in `received`, which must be expected and not filled yet
fn slot<'m, V>(
    received: &'m mut BTreeMap<i32, V>,
    filled: &mut BTreeSet<i32>,
    key: i32,
    rank: i32,
) -> ComResult<&'m mut V> {
    let value = received
        .get_mut(&key)
        .ok_or_else(|| ComError::Protocol(format!("rank {} sent unexpected key {}", rank, key)))?;
    if !filled.insert(key) {
        return Err(ComError::Protocol(format!("rank {} sent key {} twice", rank, key)));
    }
    Ok(value)
}
