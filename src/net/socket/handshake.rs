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

//! Connection handshake
//!
//! Right after the TCP connection is up, each side sends a hello message:
//! a magic number followed by its rank. The requester speaks first.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Magic number opening every hello message
pub const HANDSHAKE_MAGIC: u32 = 0xC051_2A2B;

pub const HELLO_SIZE: usize = 8;

/// Hello message identifying the rank on the other end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub magic: u32,
    pub rank: i32,
}

impl Hello {
    pub fn new(rank: i32) -> Self {
        Self {
            magic: HANDSHAKE_MAGIC,
            rank,
        }
    }

    pub fn to_bytes(&self) -> [u8; HELLO_SIZE] {
        let mut bytes = [0u8; HELLO_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.rank.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HELLO_SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            rank: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == HANDSHAKE_MAGIC
    }
}

/// Send our hello and read the peer's, bounded by `timeout`
///
/// `speak_first` is true on the requesting side. Returns the peer's rank.
pub fn exchange_hello(
    stream: &mut TcpStream,
    own_rank: i32,
    speak_first: bool,
    timeout: Duration,
) -> Result<i32, String> {
    let timeout = timeout.max(Duration::from_millis(1));
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| format!("cannot set handshake timeout: {}", e))?;

    let ours = Hello::new(own_rank).to_bytes();
    let mut theirs = [0u8; HELLO_SIZE];
    if speak_first {
        stream
            .write_all(&ours)
            .map_err(|e| format!("cannot send hello: {}", e))?;
        stream
            .read_exact(&mut theirs)
            .map_err(|e| format!("no hello received: {}", e))?;
    } else {
        stream
            .read_exact(&mut theirs)
            .map_err(|e| format!("no hello received: {}", e))?;
        stream
            .write_all(&ours)
            .map_err(|e| format!("cannot send hello: {}", e))?;
    }

    let hello = Hello::from_bytes(&theirs);
    if !hello.is_valid() {
        return Err(format!("invalid magic number {:#010x}", hello.magic));
    }

    // Normal operation blocks without limit.
    stream.set_read_timeout(None).ok();
    stream.set_write_timeout(None).ok();
    Ok(hello.rank)
}
