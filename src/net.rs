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

//! Networking and communication components
//!
//! Transports implement [`Communication`]; a [`CommunicationFactory`] fixes
//! the transport parameters and hands out unconnected channels.

pub mod comm_config;
pub mod communicate_bounding_box;
pub mod communication;
pub mod rendezvous;
pub mod socket;

#[cfg(feature = "mpi")]
pub mod mpi;

// Re-exports for convenience
pub use comm_config::{CommunicationFactory, RetryPolicy};
pub use communicate_bounding_box::CommunicateBoundingBox;
pub use communication::Communication;
pub use rendezvous::{FileRendezvous, MemoryRendezvous, RendezvousStore};
pub use socket::{SocketCommunication, SocketCommunicationFactory, SocketConfig};

/// Transport behind a communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    Socket,
    #[cfg(feature = "mpi")]
    Mpi,
}

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connected,
    Closed,
}
