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

//! Error handling for the communication core
//!
//! Every failure is surfaced to the caller as a [`ComError`]. The [`Code`]
//! groups them into the four failure classes a coupled run distinguishes,
//! plus a code for API misuse (calling an operation in the wrong state).

use std::fmt;
use std::time::Duration;

/// Failure class of a [`ComError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Invalid transport parameters or an unusable rendezvous directory
    Configuration = 1,
    /// Peer could not be reached or the handshake failed
    Connection = 2,
    /// An established stream failed mid-transfer
    Transport = 3,
    /// Received data does not have the shape the receiver expects
    Protocol = 4,
    /// Operation not valid in the current connection state
    InvalidState = 5,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Configuration => write!(f, "Configuration error"),
            Code::Connection => write!(f, "Connection error"),
            Code::Transport => write!(f, "Transport error"),
            Code::Protocol => write!(f, "Protocol error"),
            Code::InvalidState => write!(f, "Invalid state"),
        }
    }
}

/// Why a connection could not be established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The peer did not show up within the connect timeout
    Timeout(Duration),
    /// The published address refused every dial until the deadline
    Refused(String),
    /// The rendezvous entry or the interface did not yield a usable address
    BadAddress(String),
    /// The peer answered but did not speak the expected handshake
    Handshake(String),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Timeout(after) => {
                write!(f, "timed out after {}ms waiting for the peer", after.as_millis())
            }
            ConnectFailure::Refused(addr) => write!(f, "connection refused by {}", addr),
            ConnectFailure::BadAddress(msg) => write!(f, "misconfigured address: {}", msg),
            ConnectFailure::Handshake(msg) => write!(f, "handshake failed: {}", msg),
        }
    }
}

/// Both ends of a connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub acceptor: String,
    pub acceptor_rank: i32,
    pub requester: String,
    /// `None` on the accepting side before a requester introduced itself
    pub requester_rank: Option<i32>,
}

impl Endpoints {
    pub fn new(
        acceptor: impl Into<String>,
        acceptor_rank: i32,
        requester: impl Into<String>,
        requester_rank: Option<i32>,
    ) -> Self {
        Self {
            acceptor: acceptor.into(),
            acceptor_rank,
            requester: requester.into(),
            requester_rank,
        }
    }

    /// The same pair, now that the requester rank is known
    pub fn with_requester_rank(&self, rank: i32) -> Self {
        Self {
            requester_rank: Some(rank),
            ..self.clone()
        }
    }
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.requester_rank {
            Some(rank) => write!(f, "{} rank {}", self.requester, rank)?,
            None => write!(f, "{}", self.requester)?,
        }
        write!(f, " to {} rank {}", self.acceptor, self.acceptor_rank)
    }
}

/// Main error type of the communication core
#[derive(thiserror::Error, Debug)]
pub enum ComError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: could not connect {endpoints}: {cause}")]
    Connection {
        endpoints: Endpoints,
        cause: ConnectFailure,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    State(String),
}

impl ComError {
    /// Create an error from a code and a message
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Code::Configuration => ComError::Configuration(message),
            Code::Connection => ComError::Connection {
                endpoints: Endpoints::new("", -1, "", None),
                cause: ConnectFailure::Handshake(message),
            },
            Code::Transport => ComError::Transport {
                message,
                source: None,
            },
            Code::Protocol => ComError::Protocol(message),
            Code::InvalidState => ComError::State(message),
        }
    }

    /// Connection failure between `endpoints`
    pub fn connection(endpoints: &Endpoints, cause: ConnectFailure) -> Self {
        ComError::Connection {
            endpoints: endpoints.clone(),
            cause,
        }
    }

    /// Transport failure caused by an I/O error
    pub fn transport(message: impl Into<String>, source: std::io::Error) -> Self {
        ComError::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            ComError::Configuration(_) => Code::Configuration,
            ComError::Connection { .. } => Code::Connection,
            ComError::Transport { .. } => Code::Transport,
            ComError::Protocol(_) => Code::Protocol,
            ComError::State(_) => Code::InvalidState,
        }
    }
}

/// Type alias for Results using ComError
pub type ComResult<T> = Result<T, ComError>;
