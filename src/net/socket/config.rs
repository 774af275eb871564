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

//! Socket transport configuration
//!
//! # Example using builder pattern
//! ```
//! use std::time::Duration;
//! use cosim_com::net::socket::SocketConfig;
//!
//! let config = SocketConfig::builder()
//!     .port(0)
//!     .reuse_address(true)
//!     .network("lo")
//!     .address_directory("coupling-run")
//!     .connect_timeout(Duration::from_secs(5))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ComError, ComResult};
use crate::net::comm_config::RetryPolicy;

pub const ENV_PORT: &str = "COSIM_COM_PORT";
pub const ENV_REUSE_ADDRESS: &str = "COSIM_COM_REUSE_ADDRESS";
pub const ENV_NETWORK: &str = "COSIM_COM_NETWORK";
pub const ENV_ADDRESS_DIRECTORY: &str = "COSIM_COM_ADDRESS_DIRECTORY";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "COSIM_COM_CONNECT_TIMEOUT_MS";

/// Fixed parameters of the socket transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    port: i32,
    reuse_address: bool,
    network: String,
    address_directory: PathBuf,
    retry: RetryPolicy,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfigBuilder::default().build()
    }
}

impl SocketConfig {
    pub fn builder() -> SocketConfigBuilder {
        SocketConfigBuilder::new()
    }

    /// Defaults overridden by the `COSIM_COM_*` environment variables
    pub fn from_env() -> ComResult<Self> {
        let mut builder = SocketConfigBuilder::new();

        if let Ok(port) = std::env::var(ENV_PORT) {
            let port = port.trim().parse::<i32>().map_err(|e| {
                ComError::Configuration(format!("{}={} is not a port: {}", ENV_PORT, port, e))
            })?;
            builder = builder.port(port);
        }
        if let Ok(reuse) = std::env::var(ENV_REUSE_ADDRESS) {
            let reuse = match reuse.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(ComError::Configuration(format!(
                        "{}={} is not a boolean",
                        ENV_REUSE_ADDRESS, other
                    )))
                }
            };
            builder = builder.reuse_address(reuse);
        }
        if let Ok(network) = std::env::var(ENV_NETWORK) {
            builder = builder.network(network.trim());
        }
        if let Ok(directory) = std::env::var(ENV_ADDRESS_DIRECTORY) {
            builder = builder.address_directory(directory);
        }
        if let Ok(timeout) = std::env::var(ENV_CONNECT_TIMEOUT_MS) {
            let millis = timeout.trim().parse::<u64>().map_err(|e| {
                ComError::Configuration(format!(
                    "{}={} is not a duration in milliseconds: {}",
                    ENV_CONNECT_TIMEOUT_MS, timeout, e
                ))
            })?;
            builder = builder.connect_timeout(Duration::from_millis(millis));
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    /// Check the parameters; every failure is a configuration error
    pub fn validate(&self) -> ComResult<()> {
        if !(0..=i32::from(u16::MAX)).contains(&self.port) {
            return Err(ComError::Configuration(format!(
                "port {} is outside 0..=65535",
                self.port
            )));
        }
        if self.network.trim().is_empty() {
            return Err(ComError::Configuration(
                "network interface name is empty".to_string(),
            ));
        }
        self.retry.validate()
    }

    /// Listening port, 0 for an ephemeral port
    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn reuse_address(&self) -> bool {
        self.reuse_address
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    /// Configured directory, `.` when none was given
    pub fn address_directory(&self) -> &Path {
        if self.address_directory.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.address_directory
        }
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }
}

/// Builder for SocketConfig with sensible defaults
#[derive(Debug, Clone)]
pub struct SocketConfigBuilder {
    port: i32,
    reuse_address: bool,
    network: String,
    address_directory: PathBuf,
    retry: RetryPolicy,
}

impl Default for SocketConfigBuilder {
    fn default() -> Self {
        Self {
            port: 0,
            reuse_address: false,
            network: "lo".to_string(),
            address_directory: PathBuf::from("."),
            retry: RetryPolicy::default(),
        }
    }
}

impl SocketConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listening port (default: 0, any free port)
    pub fn port(mut self, port: i32) -> Self {
        self.port = port;
        self
    }

    /// Allow rebinding a recently used port (default: false)
    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Set the network interface name or IPv4 address (default: "lo")
    pub fn network(mut self, network: &str) -> Self {
        self.network = network.to_string();
        self
    }

    /// Set the rendezvous directory (default: ".")
    pub fn address_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.address_directory = directory.as_ref().to_path_buf();
        self
    }

    /// Set how long connection establishment may take (default: 30s)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.retry.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry backoff bounds (default: 10ms to 500ms)
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry.initial_backoff_ms = initial.as_millis() as u64;
        self.retry.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> SocketConfig {
        SocketConfig {
            port: self.port,
            reuse_address: self.reuse_address,
            network: self.network,
            address_directory: self.address_directory,
            retry: self.retry,
        }
    }
}
