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

//! TCP socket transport
//!
//! ```text
//! acceptor                               requester
//! --------                               ---------
//! bind + listen (socket2)
//! publish "host:port" ───► rendezvous ◄── poll with backoff
//! accept (non-blocking, until deadline) ◄─ connect_timeout
//! read hello(rank)                    ◄── write hello(rank)
//! write hello(rank)                   ──► read hello, check rank
//! remove rendezvous entry
//! ```

pub mod communication;
pub mod config;
pub mod handshake;
pub mod interface;

pub use communication::{SocketCommunication, SocketCommunicationFactory};
pub use config::{SocketConfig, SocketConfigBuilder};
