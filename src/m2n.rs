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

//! Many-to-many connection between two participants
//!
//! An [`M2N`] links a participant of `P` ranks to one of `Q` ranks. It is
//! built in two phases:
//!
//! 1. the master phase connects rank 0 to remote rank 0. The two masters
//!    swap their group sizes. Every other rank asks its master for the
//!    remote size with a fresh token under [`layout_request_key`], and the
//!    master answers under [`layout_key`] echoing that token. Entries left
//!    by an earlier run never carry the token of the current one;
//! 2. the slaves phase connects the ranks of both groups. Slots
//!    `s in 0..max(P, Q)` pair requester rank `s % P` with acceptor rank
//!    `s % Q`, so every rank on both sides has at least one partner.
//!
//! One participant calls the `accept_*` operations, the other the
//! `request_*` ones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::error::{ComError, ComResult, ConnectFailure, Endpoints};
use crate::net::rendezvous::{layout_key, layout_request_key, master_channel_name};
use crate::net::{Communication, CommunicationFactory, RendezvousStore};
use crate::util::uuid::generate_uuid;

/// Rank of the master in every participant
pub const MASTER_RANK: i32 = 0;

/// Connection phase of an [`M2N`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum M2NState {
    Unconnected,
    MasterConnected,
    FullyConnected,
    Closed,
}

/// The calling process and the group it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalGroup {
    pub name: String,
    pub rank: i32,
    pub size: i32,
}

impl LocalGroup {
    pub fn new(name: &str, rank: i32, size: i32) -> ComResult<Self> {
        if name.is_empty() {
            return Err(ComError::Configuration("participant name is empty".to_string()));
        }
        if size < 1 || rank < 0 || rank >= size {
            return Err(ComError::Configuration(format!(
                "rank {} is not part of a group of {}",
                rank, size
            )));
        }
        Ok(Self {
            name: name.to_string(),
            rank,
            size,
        })
    }

    pub fn is_master(&self) -> bool {
        self.rank == MASTER_RANK
    }
}

/// Remote ranks that `rank` pairs with
///
/// `requesters` and `acceptors` are the group sizes `P` and `Q`; `rank`
/// belongs to the acceptor group when `is_acceptor` is set.
pub fn slot_partners(rank: i32, requesters: i32, acceptors: i32, is_acceptor: bool) -> Vec<i32> {
    let (own_size, remote_size) = if is_acceptor {
        (acceptors, requesters)
    } else {
        (requesters, acceptors)
    };
    let partners: BTreeSet<i32> = (0..requesters.max(acceptors))
        .filter(|slot| slot % own_size == rank)
        .map(|slot| slot % remote_size)
        .collect();
    partners.into_iter().collect()
}

/// Connection between all ranks of two participants
pub struct M2N {
    local: LocalGroup,
    remote_name: String,
    remote_size: Option<i32>,
    master_factory: Arc<dyn CommunicationFactory>,
    slaves_factory: Arc<dyn CommunicationFactory>,
    master: Option<Box<dyn Communication>>,
    slaves: Vec<Box<dyn Communication>>,
    /// Remote rank -> index into `slaves`
    routes: BTreeMap<i32, usize>,
    /// Rendezvous entries this rank published and has not removed yet
    published: Vec<String>,
    state: M2NState,
}

impl M2N {
    pub fn new(
        local: LocalGroup,
        remote_name: &str,
        master_factory: Arc<dyn CommunicationFactory>,
        slaves_factory: Arc<dyn CommunicationFactory>,
    ) -> Self {
        Self {
            local,
            remote_name: remote_name.to_string(),
            remote_size: None,
            master_factory,
            slaves_factory,
            master: None,
            slaves: Vec::new(),
            routes: BTreeMap::new(),
            published: Vec::new(),
            state: M2NState::Unconnected,
        }
    }

    /// Use the same transport for the master and the per-rank channels
    pub fn with_factory(
        local: LocalGroup,
        remote_name: &str,
        factory: Arc<dyn CommunicationFactory>,
    ) -> Self {
        Self::new(local, remote_name, Arc::clone(&factory), factory)
    }

    pub fn state(&self) -> M2NState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == M2NState::FullyConnected
    }

    pub fn local(&self) -> &LocalGroup {
        &self.local
    }

    /// Size of the remote group, known once the master phase is done
    pub fn remote_size(&self) -> Option<i32> {
        self.remote_size
    }

    /// Remote ranks reachable through [`M2N::communication`]
    pub fn remote_ranks(&self) -> Vec<i32> {
        self.routes.keys().copied().collect()
    }

    /// The channel between both masters; only rank 0 has one
    pub fn master_communication(&mut self) -> ComResult<&mut dyn Communication> {
        match self.master.as_mut() {
            Some(master) => Ok(&mut **master),
            None if self.local.is_master() => Err(ComError::State(format!(
                "master connection of {} is {:?}",
                self.local.name, self.state
            ))),
            None => Err(ComError::State(format!(
                "rank {} of {} has no master connection",
                self.local.rank, self.local.name
            ))),
        }
    }

    /// The channel that reaches `remote_rank`; pass `remote_rank` to its operations
    pub fn communication(&mut self, remote_rank: i32) -> ComResult<&mut dyn Communication> {
        if self.state != M2NState::FullyConnected {
            return Err(ComError::State(format!(
                "per-rank channels of {} are not connected ({:?})",
                self.local.name, self.state
            )));
        }
        let index = *self.routes.get(&remote_rank).ok_or_else(|| {
            ComError::State(format!(
                "rank {} of {} is not paired with rank {} of {}",
                self.local.rank, self.local.name, remote_rank, self.remote_name
            ))
        })?;
        Ok(&mut *self.slaves[index])
    }

    pub fn accept_master_connection(&mut self) -> ComResult<()> {
        self.master_phase(true)
    }

    pub fn request_master_connection(&mut self) -> ComResult<()> {
        self.master_phase(false)
    }

    pub fn accept_slaves_connection(&mut self) -> ComResult<()> {
        self.slaves_phase(true)
    }

    pub fn request_slaves_connection(&mut self) -> ComResult<()> {
        self.slaves_phase(false)
    }

    /// Close the per-rank channels, then the master channel
    ///
    /// Closing twice is a no-op. The first error is reported after every
    /// channel had its chance to close.
    pub fn close_connection(&mut self) -> ComResult<()> {
        if self.state == M2NState::Closed
            || (self.state == M2NState::Unconnected && self.master.is_none())
        {
            return Ok(());
        }
        let result = self.teardown();
        self.state = M2NState::Closed;
        log::info!(
            "Closed connection of {} rank {} to {}",
            self.local.name, self.local.rank, self.remote_name
        );
        result
    }

    fn master_phase(&mut self, is_acceptor: bool) -> ComResult<()> {
        if self.state != M2NState::Unconnected {
            return Err(ComError::State(format!(
                "master connection requested in state {:?}",
                self.state
            )));
        }

        let result = if self.local.is_master() {
            self.connect_master(is_acceptor)
        } else {
            self.request_layout()
        };
        match result {
            Ok(remote_size) => {
                self.remote_size = Some(remote_size);
                self.state = M2NState::MasterConnected;
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Master phase of {} rank {} failed: {}",
                    self.local.name, self.local.rank, e
                );
                if let Err(close) = self.teardown() {
                    log::warn!("Teardown after failed master phase: {}", close);
                }
                Err(e)
            }
        }
    }

    fn connect_master(&mut self, is_acceptor: bool) -> ComResult<i32> {
        let mut master = self.master_factory.new_communication()?;
        if is_acceptor {
            let requester = master_channel_name(&self.remote_name);
            master.accept_connection(&self.local.name, &requester, MASTER_RANK, 1)?;
        } else {
            let requester = master_channel_name(&self.local.name);
            master.request_connection(&self.remote_name, &requester, MASTER_RANK, MASTER_RANK)?;
        }
        let master = self.master.insert(master);

        let remote_size = if is_acceptor {
            master.send_int(self.local.size, MASTER_RANK)?;
            master.receive_int(MASTER_RANK)?
        } else {
            let size = master.receive_int(MASTER_RANK)?;
            master.send_int(self.local.size, MASTER_RANK)?;
            size
        };
        if remote_size < 1 {
            return Err(ComError::Protocol(format!(
                "{} announced a group of {} ranks",
                self.remote_name, remote_size
            )));
        }
        log::info!(
            "Master of {} ({} ranks) connected to master of {} ({} ranks)",
            self.local.name, self.local.size, self.remote_name, remote_size
        );

        if self.local.size > 1 {
            self.answer_layout_requests(remote_size)?;
        }
        Ok(remote_size)
    }

    /// Pair of this rank and the local master, for errors of the layout exchange
    fn layout_endpoints(&self, rank: i32) -> Endpoints {
        Endpoints::new(&self.local.name, MASTER_RANK, &self.local.name, Some(rank))
    }

    /// Answer the layout request of every other local rank
    ///
    /// Returns once each rank has taken its answer, which it signals by
    /// removing its request.
    fn answer_layout_requests(&mut self, remote_size: i32) -> ComResult<()> {
        let store = self.master_factory.rendezvous();
        let retry = self.master_factory.retry_policy();
        let deadline = Instant::now() + retry.timeout();
        let mut answered: BTreeMap<i32, String> = BTreeMap::new();
        let mut waiting: BTreeSet<i32> = (1..self.local.size).collect();
        let mut attempt = 0u32;

        loop {
            for rank in waiting.clone() {
                let request = layout_request_key(&self.local.name, &self.remote_name, rank);
                match store.lookup(&request)? {
                    Some(token) if answered.get(&rank) != Some(&token) => {
                        let key = layout_key(&self.local.name, &self.remote_name, rank);
                        store.publish(&key, &format!("{} {}", remote_size, token))?;
                        if !self.published.contains(&key) {
                            self.published.push(key);
                        }
                        answered.insert(rank, token);
                    }
                    Some(_) => {}
                    None if answered.contains_key(&rank) => {
                        waiting.remove(&rank);
                    }
                    None => {}
                }
            }
            if waiting.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                let missing: Vec<i32> = waiting.into_iter().collect();
                log::error!(
                    "Ranks {:?} of {} did not take their layout answer",
                    missing, self.local.name
                );
                return Err(ComError::connection(
                    &self.layout_endpoints(missing[0]),
                    ConnectFailure::Timeout(retry.timeout()),
                ));
            }
            thread::sleep(retry.backoff(attempt).min(deadline - now));
            attempt = attempt.saturating_add(1);
        }

        remove_entries(store.as_ref(), &mut self.published)
    }

    /// Remote group size, asked from the local master
    fn request_layout(&mut self) -> ComResult<i32> {
        let store = self.master_factory.rendezvous();
        let token = generate_uuid();
        let request = layout_request_key(&self.local.name, &self.remote_name, self.local.rank);
        store.publish(&request, &token)?;
        self.published.push(request);

        let size = self.wait_for_layout(store.as_ref(), &token)?;
        // The master takes the removed request as the acknowledgement.
        remove_entries(store.as_ref(), &mut self.published)?;
        Ok(size)
    }

    fn wait_for_layout(&self, store: &dyn RendezvousStore, token: &str) -> ComResult<i32> {
        let key = layout_key(&self.local.name, &self.remote_name, self.local.rank);
        let retry = self.master_factory.retry_policy();
        let deadline = Instant::now() + retry.timeout();
        let mut attempt = 0u32;

        loop {
            if let Some(value) = store.lookup(&key)? {
                let mut fields = value.split_whitespace();
                let size = fields.next();
                if fields.next() == Some(token) && fields.next().is_none() {
                    let size = size.and_then(|size| size.parse::<i32>().ok()).filter(|size| *size > 0);
                    return size.ok_or_else(|| {
                        ComError::connection(
                            &self.layout_endpoints(self.local.rank),
                            ConnectFailure::BadAddress(format!("layout entry {} holds {:?}", key, value)),
                        )
                    });
                }
                log::debug!("Ignoring layout entry {} of another run", key);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ComError::connection(
                    &self.layout_endpoints(self.local.rank),
                    ConnectFailure::Timeout(retry.timeout()),
                ));
            }
            log::debug!("Rank {} waiting for layout entry {}", self.local.rank, key);
            thread::sleep(retry.backoff(attempt).min(deadline - now));
            attempt = attempt.saturating_add(1);
        }
    }

    fn slaves_phase(&mut self, is_acceptor: bool) -> ComResult<()> {
        if self.state != M2NState::MasterConnected {
            return Err(ComError::State(format!(
                "per-rank channels need a master connection, state is {:?}",
                self.state
            )));
        }

        match self.connect_slaves(is_acceptor) {
            Ok(()) => {
                self.state = M2NState::FullyConnected;
                log::info!(
                    "{} rank {} connected to ranks {:?} of {}",
                    self.local.name,
                    self.local.rank,
                    self.remote_ranks(),
                    self.remote_name
                );
                Ok(())
            }
            Err(e) => {
                log::error!(
                    "Per-rank connection of {} rank {} failed: {}",
                    self.local.name, self.local.rank, e
                );
                if let Err(close) = self.teardown() {
                    log::warn!("Teardown after failed per-rank connection: {}", close);
                }
                self.state = M2NState::Closed;
                Err(e)
            }
        }
    }

    fn connect_slaves(&mut self, is_acceptor: bool) -> ComResult<()> {
        let remote_size = self
            .remote_size
            .ok_or_else(|| ComError::State("remote group size is unknown".to_string()))?;
        let (requesters, acceptors) = if is_acceptor {
            (remote_size, self.local.size)
        } else {
            (self.local.size, remote_size)
        };
        let partners = slot_partners(self.local.rank, requesters, acceptors, is_acceptor);
        log::debug!(
            "{} rank {} pairs with ranks {:?} of {}",
            self.local.name, self.local.rank, partners, self.remote_name
        );

        if is_acceptor {
            let mut channel = self.slaves_factory.new_communication()?;
            channel.accept_connection(
                &self.local.name,
                &self.remote_name,
                self.local.rank,
                partners.len(),
            )?;
            let connected = channel.remote_ranks();
            if connected != partners {
                return Err(ComError::Protocol(format!(
                    "expected ranks {:?} of {}, got {:?}",
                    partners, self.remote_name, connected
                )));
            }
            self.add_slave(channel);
        } else {
            for acceptor_rank in partners {
                let mut channel = self.slaves_factory.new_communication()?;
                channel.request_connection(
                    &self.remote_name,
                    &self.local.name,
                    acceptor_rank,
                    self.local.rank,
                )?;
                self.add_slave(channel);
            }
        }
        Ok(())
    }

    fn add_slave(&mut self, channel: Box<dyn Communication>) {
        let index = self.slaves.len();
        for rank in channel.remote_ranks() {
            self.routes.insert(rank, index);
        }
        self.slaves.push(channel);
    }

    fn teardown(&mut self) -> ComResult<()> {
        let mut first_error = None;
        self.routes.clear();
        for mut slave in self.slaves.drain(..) {
            if let Err(e) = slave.close_connection() {
                log::warn!("Closing per-rank channel: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut master) = self.master.take() {
            if let Err(e) = master.close_connection() {
                log::warn!("Closing master channel: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = remove_entries(self.master_factory.rendezvous().as_ref(), &mut self.published) {
            log::warn!("Removing layout entries: {}", e);
            first_error.get_or_insert(e);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Remove every key of `keys` from `store`; keys that could not be removed stay listed
fn remove_entries(store: &dyn RendezvousStore, keys: &mut Vec<String>) -> ComResult<()> {
    while let Some(key) = keys.last() {
        store.remove(key)?;
        keys.pop();
    }
    Ok(())
}

impl Drop for M2N {
    fn drop(&mut self) {
        if let Err(e) = self.close_connection() {
            log::warn!("Closing connection to {}: {}", self.remote_name, e);
        }
    }
}
