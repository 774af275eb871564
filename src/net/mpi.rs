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

//! Message-passing communication over the MPI world communicator
//!
//! Both participants are started by one launcher and share
//! `MPI_COMM_WORLD`, each occupying a contiguous block of world ranks.
//! Connecting only swaps hellos with the expected peers; the data then
//! travels as MPI messages. Initializing MPI (and keeping the `Universe`
//! alive) is the caller's job.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mpi::point_to_point::Status;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Tag;

use crate::error::{ComError, ComResult, ConnectFailure, Endpoints};
use crate::net::comm_config::{CommunicationFactory, RetryPolicy};
use crate::net::rendezvous::{address_key, participant_name, FileRendezvous, RendezvousStore};
use crate::net::socket::handshake::{Hello, HELLO_SIZE};
use crate::net::{ChannelState, CommType, Communication};

/// First world rank of every participant
pub type WorldLayout = BTreeMap<String, i32>;

/// Tags stay below the smallest upper bound MPI guarantees
const TAG_LIMIT: u32 = 32_768;

/// Poll interval while waiting for a hello
const HELLO_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Message tag of the channel behind `key`, the same on both sides
fn channel_tag(key: &str) -> Tag {
    // FNV-1a
    let hash = key
        .bytes()
        .fold(0x811c_9dc5u32, |hash, byte| (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193));
    (hash % TAG_LIMIT) as Tag
}

/// Next message on `tag` from `source`, `None` once `deadline` has passed
fn receive_before<S: Source>(source: &S, tag: Tag, deadline: Instant) -> Option<(Vec<u8>, Status)> {
    loop {
        if let Some((message, _status)) = source.immediate_matched_probe_with_tag(tag) {
            return Some(message.matched_receive_vec::<u8>());
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(HELLO_POLL_INTERVAL);
    }
}

/// Communication between participants sharing `MPI_COMM_WORLD`
///
/// Every channel sends on its own tag, so a master channel and a per-rank
/// channel between the same two processes do not steal each other's
/// messages.
pub struct MpiDirectCommunication {
    layout: Arc<WorldLayout>,
    retry: RetryPolicy,
    tag: Tag,
    /// Remote participant rank -> world rank
    peers: BTreeMap<i32, i32>,
    /// Bytes of partially consumed messages, per remote rank
    pending: HashMap<i32, VecDeque<u8>>,
    state: ChannelState,
}

impl MpiDirectCommunication {
    pub fn new(layout: Arc<WorldLayout>, retry: RetryPolicy) -> Self {
        Self {
            layout,
            retry,
            tag: 0,
            peers: BTreeMap::new(),
            pending: HashMap::new(),
            state: ChannelState::Unconnected,
        }
    }

    fn world() -> ComResult<SimpleCommunicator> {
        if !mpi::environment::is_initialized() || mpi::environment::is_finalized() {
            return Err(ComError::State("MPI is not initialized".to_string()));
        }
        Ok(SimpleCommunicator::world())
    }

    /// First world rank of the participant behind `name`
    fn offset(&self, name: &str, endpoints: &Endpoints) -> ComResult<i32> {
        let participant = participant_name(name);
        self.layout.get(participant).copied().ok_or_else(|| {
            ComError::connection(
                endpoints,
                ConnectFailure::BadAddress(format!("{} has no world rank block", participant)),
            )
        })
    }

    fn ensure_unconnected(&self) -> ComResult<()> {
        if self.state == ChannelState::Connected {
            return Err(ComError::State("channel is already connected".to_string()));
        }
        Ok(())
    }

    fn peer(&self, rank: i32) -> ComResult<i32> {
        if self.state != ChannelState::Connected {
            return Err(ComError::State(format!(
                "channel is {:?}, cannot talk to rank {}",
                self.state, rank
            )));
        }
        self.peers
            .get(&rank)
            .copied()
            .ok_or_else(|| ComError::State(format!("no connection to remote rank {}", rank)))
    }
}

fn parse_hello(bytes: &[u8]) -> Result<Hello, String> {
    let bytes: [u8; HELLO_SIZE] = bytes
        .try_into()
        .map_err(|_| format!("hello of {} bytes", bytes.len()))?;
    let hello = Hello::from_bytes(&bytes);
    if !hello.is_valid() {
        return Err(format!("bad magic {:#x}", hello.magic));
    }
    Ok(hello)
}

impl Communication for MpiDirectCommunication {
    fn comm_type(&self) -> CommType {
        CommType::Mpi
    }

    fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    fn remote_ranks(&self) -> Vec<i32> {
        self.peers.keys().copied().collect()
    }

    fn accept_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_count: usize,
    ) -> ComResult<()> {
        self.ensure_unconnected()?;
        let world = Self::world()?;
        let endpoints = Endpoints::new(acceptor, acceptor_rank, requester, None);
        let offset = self.offset(requester, &endpoints)?;
        let tag = channel_tag(&address_key(acceptor, requester, acceptor_rank));
        let handshake_error =
            |reason: String| ComError::connection(&endpoints, ConnectFailure::Handshake(reason));
        let deadline = Instant::now() + self.retry.timeout();

        let mut peers = BTreeMap::new();
        while peers.len() < requester_count {
            let (msg, status) = receive_before(&world.any_process(), tag, deadline).ok_or_else(|| {
                ComError::connection(&endpoints, ConnectFailure::Timeout(self.retry.timeout()))
            })?;
            let world_rank = status.source_rank();
            let hello = parse_hello(&msg).map_err(&handshake_error)?;
            if world_rank - offset != hello.rank || peers.contains_key(&hello.rank) {
                return Err(handshake_error(format!(
                    "world rank {} claims to be rank {} of {}",
                    world_rank, hello.rank, requester
                )));
            }
            world
                .process_at_rank(world_rank)
                .send_with_tag(&Hello::new(acceptor_rank).to_bytes()[..], tag);
            peers.insert(hello.rank, world_rank);
        }

        self.tag = tag;
        self.peers = peers;
        self.state = ChannelState::Connected;
        log::info!(
            "{} rank {} connected to ranks {:?} of {} over MPI",
            acceptor,
            acceptor_rank,
            self.remote_ranks(),
            requester
        );
        Ok(())
    }

    fn request_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_rank: i32,
    ) -> ComResult<()> {
        self.ensure_unconnected()?;
        let world = Self::world()?;
        let endpoints = Endpoints::new(acceptor, acceptor_rank, requester, Some(requester_rank));
        let world_rank = self.offset(acceptor, &endpoints)? + acceptor_rank;
        let tag = channel_tag(&address_key(acceptor, requester, acceptor_rank));
        let deadline = Instant::now() + self.retry.timeout();

        let process = world.process_at_rank(world_rank);
        process.send_with_tag(&Hello::new(requester_rank).to_bytes()[..], tag);
        let (msg, _status) = receive_before(&process, tag, deadline).ok_or_else(|| {
            ComError::connection(&endpoints, ConnectFailure::Timeout(self.retry.timeout()))
        })?;
        let hello = parse_hello(&msg)
            .and_then(|hello| {
                if hello.rank == acceptor_rank {
                    Ok(hello)
                } else {
                    Err(format!("world rank {} answered as rank {}", world_rank, hello.rank))
                }
            })
            .map_err(|reason| ComError::connection(&endpoints, ConnectFailure::Handshake(reason)))?;

        self.tag = tag;
        self.peers.insert(hello.rank, world_rank);
        self.state = ChannelState::Connected;
        log::info!(
            "{} rank {} connected to {} rank {} over MPI",
            requester, requester_rank, acceptor, acceptor_rank
        );
        Ok(())
    }

    fn close_connection(&mut self) -> ComResult<()> {
        self.peers.clear();
        self.pending.clear();
        if self.state == ChannelState::Connected {
            self.state = ChannelState::Closed;
        }
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8], rank: i32) -> ComResult<()> {
        let world_rank = self.peer(rank)?;
        Self::world()?
            .process_at_rank(world_rank)
            .send_with_tag(data, self.tag);
        Ok(())
    }

    fn receive_bytes(&mut self, buffer: &mut [u8], rank: i32) -> ComResult<()> {
        let world_rank = self.peer(rank)?;
        let world = Self::world()?;
        let tag = self.tag;
        let wanted = buffer.len();
        let pending = self.pending.entry(rank).or_default();
        // One frame may be read in several pieces; keep the rest of a message.
        while pending.len() < wanted {
            let (msg, _status) = world.process_at_rank(world_rank).receive_vec_with_tag::<u8>(tag);
            pending.extend(msg);
        }
        for (dst, src) in buffer.iter_mut().zip(pending.drain(..wanted)) {
            *dst = src;
        }
        Ok(())
    }
}

/// Factory of [`MpiDirectCommunication`] instances
pub struct MpiDirectCommunicationFactory {
    layout: Arc<WorldLayout>,
    retry: RetryPolicy,
    directory: PathBuf,
    rendezvous: Arc<dyn RendezvousStore>,
}

impl MpiDirectCommunicationFactory {
    /// `layout` maps every participant name to its first world rank
    pub fn new(layout: WorldLayout, address_directory: impl AsRef<Path>) -> ComResult<Self> {
        if layout.values().any(|offset| *offset < 0) {
            return Err(ComError::Configuration(
                "world rank offsets must not be negative".to_string(),
            ));
        }
        let store = FileRendezvous::new(address_directory)?;
        Ok(Self {
            layout: Arc::new(layout),
            retry: RetryPolicy::default(),
            directory: store.directory().to_path_buf(),
            rendezvous: Arc::new(store),
        })
    }

    /// Bound hello exchanges and layout waits by `retry` instead of the default
    pub fn with_retry(mut self, retry: RetryPolicy) -> ComResult<Self> {
        retry.validate()?;
        self.retry = retry;
        Ok(self)
    }
}

impl CommunicationFactory for MpiDirectCommunicationFactory {
    fn comm_type(&self) -> CommType {
        CommType::Mpi
    }

    fn new_communication(&self) -> ComResult<Box<dyn Communication>> {
        Ok(Box::new(MpiDirectCommunication::new(
            Arc::clone(&self.layout),
            self.retry.clone(),
        )))
    }

    fn address_directory(&self) -> &Path {
        &self.directory
    }

    fn rendezvous(&self) -> Arc<dyn RendezvousStore> {
        Arc::clone(&self.rendezvous)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }
}
