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

//! cosim-com: communication core for coupling parallel simulation codes
//!
//! Two independently launched participants, each running on its own group
//! of processes, exchange data through an [`M2N`] connection: one master
//! channel between both rank 0 processes plus per-rank channels between the
//! groups. Channels implement the transport-agnostic
//! [`net::Communication`] trait and are created by a
//! [`net::CommunicationFactory`]. Partition metadata travels with
//! [`net::CommunicateBoundingBox`].

pub mod bounding_box;
pub mod error;
pub mod m2n;
pub mod net;
pub mod util;

// Re-export commonly used types
pub use crate::bounding_box::{BoundingBox, BoundingBoxMap, ConnectionMap};
pub use crate::error::{Code, ComError, ComResult, ConnectFailure, Endpoints};
pub use crate::m2n::{LocalGroup, M2NState, M2N};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
