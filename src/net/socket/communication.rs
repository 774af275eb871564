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

//! Socket communication and its factory

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{ComError, ComResult, ConnectFailure, Endpoints};
use crate::net::comm_config::{CommunicationFactory, RetryPolicy};
use crate::net::rendezvous::{address_key, FileRendezvous, RendezvousStore};
use crate::net::{ChannelState, CommType, Communication};

use super::config::SocketConfig;
use super::handshake::exchange_hello;
use super::interface::resolve_interface;

/// Poll interval of the non-blocking accept loop
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for the listen backlog
const MAX_BACKLOG: usize = 128;

/// Communication over TCP streams, one stream per remote rank
pub struct SocketCommunication {
    config: SocketConfig,
    rendezvous: Arc<dyn RendezvousStore>,
    streams: BTreeMap<i32, TcpStream>,
    /// Rendezvous entry this channel published and has not removed yet
    published_key: Option<String>,
    state: ChannelState,
}

impl SocketCommunication {
    pub fn new(config: SocketConfig, rendezvous: Arc<dyn RendezvousStore>) -> Self {
        Self {
            config,
            rendezvous,
            streams: BTreeMap::new(),
            published_key: None,
            state: ChannelState::Unconnected,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    fn ensure_unconnected(&self) -> ComResult<()> {
        if self.state == ChannelState::Connected {
            return Err(ComError::State("channel is already connected".to_string()));
        }
        Ok(())
    }

    fn stream(&mut self, rank: i32) -> ComResult<&mut TcpStream> {
        if self.state != ChannelState::Connected {
            return Err(ComError::State(format!(
                "channel is {:?}, cannot talk to rank {}",
                self.state, rank
            )));
        }
        self.streams.get_mut(&rank).ok_or_else(|| {
            ComError::State(format!("no connection to remote rank {}", rank))
        })
    }

    /// Tear down after a failed transfer; the channel is unusable afterwards
    fn fail(&mut self, message: String, source: std::io::Error) -> ComError {
        log::error!("{}: {}", message, source);
        if let Err(e) = self.close_connection() {
            log::warn!("Closing failed channel: {}", e);
        }
        ComError::transport(message, source)
    }

    fn bind_listener(&self) -> ComResult<Socket> {
        let ip = resolve_interface(self.config.network())?;
        let addr = SocketAddr::new(ip, self.config.port() as u16);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ComError::Configuration(format!("socket creation failed: {}", e)))?;
        socket
            .set_reuse_address(self.config.reuse_address())
            .map_err(|e| ComError::Configuration(format!("failed to set SO_REUSEADDR: {}", e)))?;
        socket
            .bind(&addr.into())
            .map_err(|e| ComError::Configuration(format!("could not bind to {}: {}", addr, e)))?;
        Ok(socket)
    }

    fn accept_all(
        &mut self,
        listener: &TcpListener,
        endpoints: &Endpoints,
        requester_count: usize,
        deadline: Instant,
    ) -> ComResult<()> {
        let acceptor_rank = endpoints.acceptor_rank;
        listener
            .set_nonblocking(true)
            .map_err(|e| ComError::Configuration(format!("failed to set non-blocking: {}", e)))?;

        let mut error_count = 0u32;
        while self.streams.len() < requester_count {
            let now = Instant::now();
            if now >= deadline {
                return Err(ComError::connection(
                    endpoints,
                    ConnectFailure::Timeout(self.config.retry().timeout()),
                ));
            }

            match listener.accept() {
                Ok((mut stream, peer)) => {
                    stream.set_nonblocking(false).map_err(|e| {
                        ComError::transport("failed to set blocking mode", e)
                    })?;
                    stream.set_nodelay(true).ok();

                    let rank = exchange_hello(&mut stream, acceptor_rank, false, deadline - now)
                        .map_err(|reason| {
                            ComError::connection(
                                endpoints,
                                ConnectFailure::Handshake(format!("{}: {}", peer, reason)),
                            )
                        })?;
                    if self.streams.contains_key(&rank) {
                        return Err(ComError::connection(
                            &endpoints.with_requester_rank(rank),
                            ConnectFailure::Handshake(format!("rank {} connected twice", rank)),
                        ));
                    }
                    log::debug!("Accepted {} from {}", endpoints.with_requester_rank(rank), peer);
                    self.streams.insert(rank, stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    log::debug!("Accept error: {}", e);
                    error_count += 1;
                    if error_count > 5 {
                        let backoff = self.config.retry().backoff(error_count - 5);
                        thread::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())));
                    }
                }
            }
        }
        Ok(())
    }

    fn dial(&mut self, endpoints: &Endpoints, requester_rank: i32, key: &str) -> ComResult<TcpStream> {
        let acceptor_rank = endpoints.acceptor_rank;
        let retry = self.config.retry().clone();
        let deadline = Instant::now() + retry.timeout();
        let mut last_refused: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            if let Some(published) = self.rendezvous.lookup(key)? {
                let addr: SocketAddr = published.parse().map_err(|e| {
                    ComError::connection(
                        endpoints,
                        ConnectFailure::BadAddress(format!(
                            "entry {} holds {:?}: {}",
                            key, published, e
                        )),
                    )
                })?;

                let remaining = deadline.saturating_duration_since(Instant::now());
                match TcpStream::connect_timeout(&addr, remaining.max(Duration::from_millis(1))) {
                    Ok(mut stream) => {
                        stream.set_nodelay(true).ok();
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        let peer_rank = exchange_hello(&mut stream, requester_rank, true, remaining)
                            .map_err(|reason| {
                                ComError::connection(
                                    endpoints,
                                    ConnectFailure::Handshake(format!("{}: {}", addr, reason)),
                                )
                            })?;
                        if peer_rank != acceptor_rank {
                            return Err(ComError::connection(
                                endpoints,
                                ConnectFailure::Handshake(format!(
                                    "{} answered as rank {}",
                                    addr, peer_rank
                                )),
                            ));
                        }
                        return Ok(stream);
                    }
                    Err(e) => {
                        // Stale entry or listener not accepting yet.
                        log::debug!("Dialing {} for {}: {}", addr, key, e);
                        last_refused = Some(addr.to_string());
                    }
                }
            } else {
                log::debug!("Waiting for rendezvous entry {}", key);
            }

            let now = Instant::now();
            if now >= deadline {
                let cause = match last_refused {
                    Some(addr) => ConnectFailure::Refused(addr),
                    None => ConnectFailure::Timeout(retry.timeout()),
                };
                return Err(ComError::connection(endpoints, cause));
            }
            thread::sleep(retry.backoff(attempt).min(deadline - now));
            attempt = attempt.saturating_add(1);
        }
    }
}

impl Communication for SocketCommunication {
    fn comm_type(&self) -> CommType {
        CommType::Socket
    }

    fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    fn remote_ranks(&self) -> Vec<i32> {
        self.streams.keys().copied().collect()
    }

    fn accept_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_count: usize,
    ) -> ComResult<()> {
        self.ensure_unconnected()?;
        if requester_count == 0 {
            return Err(ComError::Configuration(
                "at least one requester must be expected".to_string(),
            ));
        }

        let socket = self.bind_listener()?;
        let backlog = requester_count.min(MAX_BACKLOG) as i32;
        socket
            .listen(backlog)
            .map_err(|e| ComError::Configuration(format!("listen failed: {}", e)))?;
        let listener: TcpListener = socket.into();
        let mut local = listener
            .local_addr()
            .map_err(|e| ComError::Configuration(format!("no local address: {}", e)))?;
        if local.ip().is_unspecified() {
            // Bound to every interface; loopback reaches it from this host.
            local.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }

        let key = address_key(acceptor, requester, acceptor_rank);
        self.rendezvous.publish(&key, &local.to_string())?;
        self.published_key = Some(key.clone());
        log::info!(
            "{} rank {} listening on {}, waiting for {} rank(s) of {}",
            acceptor, acceptor_rank, local, requester_count, requester
        );

        let deadline = Instant::now() + self.config.retry().timeout();
        let endpoints = Endpoints::new(acceptor, acceptor_rank, requester, None);
        let result = self.accept_all(&listener, &endpoints, requester_count, deadline);

        // All expected peers are in (or never will be); the entry is stale now.
        if let Err(e) = self.rendezvous.remove(&key) {
            log::warn!("Removing rendezvous entry {}: {}", key, e);
        }
        self.published_key = None;

        match result {
            Ok(()) => {
                self.state = ChannelState::Connected;
                log::info!(
                    "{} rank {} connected to {} rank(s) {:?} of {}",
                    acceptor,
                    acceptor_rank,
                    self.streams.len(),
                    self.remote_ranks(),
                    requester
                );
                Ok(())
            }
            Err(e) => {
                log::error!("{}", e);
                self.streams.clear();
                Err(e)
            }
        }
    }

    fn request_connection(
        &mut self,
        acceptor: &str,
        requester: &str,
        acceptor_rank: i32,
        requester_rank: i32,
    ) -> ComResult<()> {
        self.ensure_unconnected()?;

        let key = address_key(acceptor, requester, acceptor_rank);
        let endpoints = Endpoints::new(acceptor, acceptor_rank, requester, Some(requester_rank));
        match self.dial(&endpoints, requester_rank, &key) {
            Ok(stream) => {
                self.streams.insert(acceptor_rank, stream);
                self.state = ChannelState::Connected;
                log::info!(
                    "{} rank {} connected to {} rank {}",
                    requester, requester_rank, acceptor, acceptor_rank
                );
                Ok(())
            }
            Err(e) => {
                log::error!("{}", e);
                Err(e)
            }
        }
    }

    fn close_connection(&mut self) -> ComResult<()> {
        for (rank, stream) in std::mem::take(&mut self.streams) {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                log::debug!("Shutdown of stream to rank {}: {}", rank, e);
            }
        }
        if let Some(key) = self.published_key.take() {
            self.rendezvous.remove(&key)?;
        }
        if self.state == ChannelState::Connected {
            self.state = ChannelState::Closed;
        }
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8], rank: i32) -> ComResult<()> {
        let result = self.stream(rank)?.write_all(data);
        result.map_err(|e| self.fail(format!("send of {} bytes to rank {} failed", data.len(), rank), e))
    }

    fn receive_bytes(&mut self, buffer: &mut [u8], rank: i32) -> ComResult<()> {
        let result = self.stream(rank)?.read_exact(buffer);
        result.map_err(|e| {
            let message = if e.kind() == ErrorKind::UnexpectedEof {
                format!("rank {} closed the connection", rank)
            } else {
                format!("receive of {} bytes from rank {} failed", buffer.len(), rank)
            };
            self.fail(message, e)
        })
    }
}

impl Drop for SocketCommunication {
    fn drop(&mut self) {
        if let Err(e) = self.close_connection() {
            log::warn!("Closing socket communication: {}", e);
        }
    }
}

/// Factory of [`SocketCommunication`] instances sharing one configuration
pub struct SocketCommunicationFactory {
    config: SocketConfig,
    directory: PathBuf,
    rendezvous: Arc<dyn RendezvousStore>,
}

impl SocketCommunicationFactory {
    /// Validate `config` and prepare its address directory
    pub fn new(config: SocketConfig) -> ComResult<Self> {
        config.validate()?;
        let store = FileRendezvous::new(config.address_directory())?;
        Ok(Self {
            directory: store.directory().to_path_buf(),
            config,
            rendezvous: Arc::new(store),
        })
    }

    /// Defaults (any port, no address reuse, loopback) with the given directory
    pub fn with_address_directory(directory: impl AsRef<Path>) -> ComResult<Self> {
        Self::new(SocketConfig::builder().address_directory(directory).build())
    }

    /// Use `rendezvous` instead of address files
    pub fn with_rendezvous(
        config: SocketConfig,
        rendezvous: Arc<dyn RendezvousStore>,
    ) -> ComResult<Self> {
        config.validate()?;
        Ok(Self {
            directory: config.address_directory().to_path_buf(),
            config,
            rendezvous,
        })
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    /// Address the factory's channels listen on, for diagnostics
    pub fn listen_address(&self) -> ComResult<IpAddr> {
        resolve_interface(self.config.network())
    }
}

impl CommunicationFactory for SocketCommunicationFactory {
    fn comm_type(&self) -> CommType {
        CommType::Socket
    }

    fn new_communication(&self) -> ComResult<Box<dyn Communication>> {
        Ok(Box::new(SocketCommunication::new(
            self.config.clone(),
            Arc::clone(&self.rendezvous),
        )))
    }

    fn address_directory(&self) -> &Path {
        &self.directory
    }

    fn rendezvous(&self) -> Arc<dyn RendezvousStore> {
        Arc::clone(&self.rendezvous)
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.retry().clone()
    }
}
