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

//! Communication factory
//!
//! A factory carries the fixed transport configuration and hands out fresh,
//! unconnected channels. Establishing the connection is up to the caller.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ComError, ComResult};

use super::rendezvous::RendezvousStore;
use super::{CommType, Communication};

/// Bounded wait used while establishing connections
///
/// The wait between two attempts starts at `initial_backoff_ms` and doubles
/// up to `max_backoff_ms`; after `timeout_ms` the attempt fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// Every wait must be bounded and every retry must sleep
    pub fn validate(&self) -> ComResult<()> {
        if self.timeout_ms == 0 {
            return Err(ComError::Configuration(
                "connect timeout must be positive".to_string(),
            ));
        }
        if self.initial_backoff_ms == 0 {
            return Err(ComError::Configuration(
                "initial backoff must be at least 1ms".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ComError::Configuration(format!(
                "initial backoff {}ms exceeds maximum backoff {}ms",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wait before retry number `attempt` (starting at 0)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms)
            .max(1);
        Duration::from_millis(millis)
    }
}

/// Factory of unconnected [`Communication`] instances of one transport
pub trait CommunicationFactory: Send + Sync {
    fn comm_type(&self) -> CommType;

    /// Create a new channel; it is never connected
    fn new_communication(&self) -> ComResult<Box<dyn Communication>>;

    /// Resolved directory used for rendezvous files
    fn address_directory(&self) -> &Path;

    /// Store used by channels of this factory to publish and find addresses
    fn rendezvous(&self) -> Arc<dyn RendezvousStore>;

    /// Bounds of waits on the rendezvous store outside of a channel
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}
