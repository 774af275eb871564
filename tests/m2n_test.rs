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

//! M2N connection tests
//!
//! Each rank of both participants runs on its own thread. The participants
//! share a temporary address directory.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cosim_com::bounding_box::{bounding_box_map_with_keys, BoundingBox, BoundingBoxMap};
use cosim_com::error::{Code, ComResult};
use cosim_com::m2n::{slot_partners, LocalGroup, M2NState, M2N};
use cosim_com::net::rendezvous::{layout_key, layout_request_key};
use cosim_com::net::socket::SocketConfig;
use cosim_com::net::{CommunicateBoundingBox, CommunicationFactory, SocketCommunicationFactory};
use cosim_com::util::logging::init_test_logging;

fn factory(directory: &Path, timeout: Duration) -> Arc<dyn CommunicationFactory> {
    let config = SocketConfig::builder()
        .network("lo")
        .address_directory(directory)
        .connect_timeout(timeout)
        .backoff(Duration::from_millis(5), Duration::from_millis(50))
        .build();
    Arc::new(SocketCommunicationFactory::new(config).unwrap())
}

fn connect(
    factory: &Arc<dyn CommunicationFactory>,
    name: &str,
    remote: &str,
    rank: i32,
    size: i32,
    accept: bool,
) -> M2N {
    let local = LocalGroup::new(name, rank, size).unwrap();
    let mut m2n = M2N::with_factory(local, remote, Arc::clone(factory));
    if accept {
        m2n.accept_master_connection().unwrap();
        assert_eq!(m2n.state(), M2NState::MasterConnected);
        m2n.accept_slaves_connection().unwrap();
    } else {
        m2n.request_master_connection().unwrap();
        assert_eq!(m2n.state(), M2NState::MasterConnected);
        m2n.request_slaves_connection().unwrap();
    }
    assert_eq!(m2n.state(), M2NState::FullyConnected);
    m2n
}

/// Code of an expected error, for results that are not `Debug`
fn error_code<T>(result: ComResult<T>) -> Code {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e.code(),
    }
}

fn partition_2d() -> BoundingBoxMap {
    let mut map = BoundingBoxMap::new();
    map.insert(0, BoundingBox::new(vec![(0.0, 1.0), (1.0, 2.0)]));
    map.insert(1, BoundingBox::new(vec![(2.0, 3.0), (3.0, 4.0)]));
    map.insert(2, BoundingBox::new(vec![(4.0, 5.0), (5.0, 6.0)]));
    map
}

// =========================================================================
// Slot Pairing Tests
// =========================================================================

#[test]
fn test_slot_partners_two_to_three() {
    // Requester group of 2, acceptor group of 3
    assert_eq!(slot_partners(0, 2, 3, false), vec![0, 2]);
    assert_eq!(slot_partners(1, 2, 3, false), vec![1]);
    assert_eq!(slot_partners(0, 2, 3, true), vec![0]);
    assert_eq!(slot_partners(1, 2, 3, true), vec![1]);
    assert_eq!(slot_partners(2, 2, 3, true), vec![0]);
}

#[test]
fn test_slot_partners_cover_every_rank() {
    for requesters in 1..6 {
        for acceptors in 1..6 {
            for rank in 0..requesters {
                assert!(!slot_partners(rank, requesters, acceptors, false).is_empty());
            }
            for rank in 0..acceptors {
                let partners = slot_partners(rank, requesters, acceptors, true);
                assert!(!partners.is_empty());
                // Both sides agree on every pair
                for partner in partners {
                    assert!(slot_partners(partner, requesters, acceptors, false).contains(&rank));
                }
            }
        }
    }
}

#[test]
fn test_slot_partners_equal_groups() {
    for rank in 0..4 {
        assert_eq!(slot_partners(rank, 4, 4, false), vec![rank]);
        assert_eq!(slot_partners(rank, 4, 4, true), vec![rank]);
    }
}

// =========================================================================
// Connection Tests
// =========================================================================

#[test]
fn test_m2n_two_to_three() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(20));
    let barrier = Arc::new(Barrier::new(5));

    // Fluid has 3 ranks and accepts, Solid has 2 ranks and requests.
    let mut handles = Vec::new();
    for rank in 0..3 {
        let factory = Arc::clone(&factory);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut m2n = connect(&factory, "Fluid", "Solid", rank, 3, true);
            assert_eq!(m2n.remote_size(), Some(2));
            let remote_ranks = m2n.remote_ranks();

            if rank == 0 {
                let master = m2n.master_communication().unwrap();
                CommunicateBoundingBox::new(master)
                    .send_bounding_box_map(&partition_2d(), 0)
                    .unwrap();
            }
            for remote in &remote_ranks {
                m2n.communication(*remote).unwrap().send_int(100 + rank, *remote).unwrap();
            }
            for remote in &remote_ranks {
                let reply = m2n.communication(*remote).unwrap().receive_int(*remote).unwrap();
                assert_eq!(reply, 200 + remote);
            }

            barrier.wait();
            m2n.close_connection().unwrap();
            (rank, remote_ranks, None::<BoundingBoxMap>)
        }));
    }
    for rank in 0..2 {
        let factory = Arc::clone(&factory);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut m2n = connect(&factory, "Solid", "Fluid", rank, 2, false);
            assert_eq!(m2n.remote_size(), Some(3));
            let remote_ranks = m2n.remote_ranks();

            let received = if rank == 0 {
                let mut map = bounding_box_map_with_keys(0..3, 2);
                let master = m2n.master_communication().unwrap();
                CommunicateBoundingBox::new(master)
                    .receive_bounding_box_map(&mut map, 0)
                    .unwrap();
                Some(map)
            } else {
                assert_eq!(error_code(m2n.master_communication()), Code::InvalidState);
                None
            };
            for remote in &remote_ranks {
                let value = m2n.communication(*remote).unwrap().receive_int(*remote).unwrap();
                assert_eq!(value, 100 + remote);
            }
            for remote in &remote_ranks {
                m2n.communication(*remote).unwrap().send_int(200 + rank, *remote).unwrap();
            }

            barrier.wait();
            m2n.close_connection().unwrap();
            (rank + 10, remote_ranks, received)
        }));
    }

    let mut results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    results.sort_by_key(|(rank, _, _)| *rank);

    // Fluid ranks 0..3, then Solid ranks 10 and 11
    assert_eq!(results[0].1, vec![0]);
    assert_eq!(results[1].1, vec![1]);
    assert_eq!(results[2].1, vec![0]);
    assert_eq!(results[3].1, vec![0, 2]);
    assert_eq!(results[4].1, vec![1]);
    assert_eq!(results[3].2.as_ref(), Some(&partition_2d()));

    // Nothing is left behind in the address directory
    assert!(!dir.path().join(layout_key("Fluid", "Solid", 1)).exists());
    assert!(!dir.path().join(layout_key("Solid", "Fluid", 1)).exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_bounding_box_scenario_over_master() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(20));

    let sender_factory = Arc::clone(&factory);
    let sender = thread::spawn(move || {
        let mut m2n = connect(&sender_factory, "A", "B", 0, 1, false);
        let master = m2n.master_communication().unwrap();
        let mut protocol = CommunicateBoundingBox::new(master);
        protocol
            .send_bounding_box(&BoundingBox::new(vec![(0.0, 1.0); 3]), 0)
            .unwrap();
        protocol.send_bounding_box_map(&partition_2d(), 0).unwrap();
        // Keep the channel open until the receiver is done
        m2n.master_communication().unwrap().receive_bool(0).unwrap();
    });

    let mut m2n = connect(&factory, "B", "A", 0, 1, true);
    let mut bb = BoundingBox::with_dimensions(3);
    let mut map = bounding_box_map_with_keys(0..3, 2);
    {
        let master = m2n.master_communication().unwrap();
        let mut protocol = CommunicateBoundingBox::new(master);
        protocol.receive_bounding_box(&mut bb, 0).unwrap();
        protocol.receive_bounding_box_map(&mut map, 0).unwrap();
    }
    m2n.master_communication().unwrap().send_bool(true, 0).unwrap();
    sender.join().unwrap();

    assert_eq!(bb.pairs(), &[(0.0, 1.0), (0.0, 1.0), (0.0, 1.0)]);
    assert_eq!(map, partition_2d());
}

#[test]
fn test_separate_master_and_slaves_factories() {
    init_test_logging();
    let master_dir = tempfile::tempdir().unwrap();
    let slaves_dir = tempfile::tempdir().unwrap();
    let master_factory = factory(master_dir.path(), Duration::from_secs(20));
    let slaves_factory = factory(slaves_dir.path(), Duration::from_secs(20));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = [(0, true), (1, true), (0, false), (1, false)]
        .into_iter()
        .map(|(rank, accept)| {
            let master_factory = Arc::clone(&master_factory);
            let slaves_factory = Arc::clone(&slaves_factory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let (name, remote) = if accept { ("Left", "Right") } else { ("Right", "Left") };
                let local = LocalGroup::new(name, rank, 2).unwrap();
                let mut m2n = M2N::new(local, remote, master_factory, slaves_factory);
                if accept {
                    m2n.accept_master_connection().unwrap();
                    m2n.accept_slaves_connection().unwrap();
                    m2n.communication(rank).unwrap().send_double(rank as f64, rank).unwrap();
                } else {
                    m2n.request_master_connection().unwrap();
                    m2n.request_slaves_connection().unwrap();
                    let value = m2n.communication(rank).unwrap().receive_double(rank).unwrap();
                    assert_eq!(value, rank as f64);
                }
                // Keep every channel open until all ranks are done
                barrier.wait();
                m2n.remote_ranks()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().len(), 1);
    }
}

// =========================================================================
// State Tests
// =========================================================================

#[test]
fn test_slaves_before_master_is_state_error() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(1));
    let mut m2n = M2N::with_factory(LocalGroup::new("Fluid", 0, 2).unwrap(), "Solid", factory);

    assert_eq!(m2n.accept_slaves_connection().unwrap_err().code(), Code::InvalidState);
    assert_eq!(m2n.request_slaves_connection().unwrap_err().code(), Code::InvalidState);
    assert_eq!(error_code(m2n.communication(0)), Code::InvalidState);
    assert_eq!(error_code(m2n.master_communication()), Code::InvalidState);
    assert_eq!(m2n.state(), M2NState::Unconnected);
    assert!(!m2n.is_connected());
    assert!(m2n.remote_ranks().is_empty());
}

#[test]
fn test_close_is_idempotent() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(20));

    let requester_factory = Arc::clone(&factory);
    let requester = thread::spawn(move || {
        let mut m2n = connect(&requester_factory, "Solid", "Fluid", 0, 1, false);
        m2n.close_connection().unwrap();
        m2n.close_connection().unwrap();
        m2n.state()
    });

    let mut m2n = connect(&factory, "Fluid", "Solid", 0, 1, true);
    assert_eq!(requester.join().unwrap(), M2NState::Closed);

    m2n.close_connection().unwrap();
    m2n.close_connection().unwrap();
    assert_eq!(m2n.state(), M2NState::Closed);
    assert_eq!(error_code(m2n.communication(0)), Code::InvalidState);
    assert_eq!(error_code(m2n.master_communication()), Code::InvalidState);
    assert_eq!(m2n.accept_master_connection().unwrap_err().code(), Code::InvalidState);
}

#[test]
fn test_unpaired_rank_is_state_error() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(20));

    let requester_factory = Arc::clone(&factory);
    let requester = thread::spawn(move || {
        let m2n = connect(&requester_factory, "Solid", "Fluid", 0, 1, false);
        m2n.remote_ranks()
    });

    let mut m2n = connect(&factory, "Fluid", "Solid", 0, 1, true);
    assert_eq!(requester.join().unwrap(), vec![0]);
    assert_eq!(error_code(m2n.communication(3)), Code::InvalidState);
}

#[test]
fn test_failed_slaves_tear_down_master() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_millis(500));

    let acceptor_factory = Arc::clone(&factory);
    let acceptor = thread::spawn(move || {
        let local = LocalGroup::new("Fluid", 0, 1).unwrap();
        let mut m2n = M2N::with_factory(local, "Solid", acceptor_factory);
        m2n.accept_master_connection().unwrap();
        // Never opens its per-rank channel
        let result = m2n.master_communication().unwrap().receive_int(0);
        (m2n, result)
    });

    let local = LocalGroup::new("Solid", 0, 1).unwrap();
    let mut m2n = M2N::with_factory(local, "Fluid", factory);
    m2n.request_master_connection().unwrap();
    let err = m2n.request_slaves_connection().unwrap_err();
    assert_eq!(err.code(), Code::Connection);
    assert_eq!(m2n.state(), M2NState::Closed);
    assert!(m2n.master_communication().is_err());

    // The master channel went down with the failed attempt
    let (_acceptor, result) = acceptor.join().unwrap();
    assert_eq!(result.unwrap_err().code(), Code::Transport);
}

#[test]
fn test_non_master_times_out_without_layout() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_millis(200));
    let mut m2n = M2N::with_factory(LocalGroup::new("Fluid", 1, 2).unwrap(), "Solid", factory);

    let err = m2n.accept_master_connection().unwrap_err();
    assert_eq!(err.code(), Code::Connection);
    assert_eq!(m2n.state(), M2NState::Unconnected);
    // The unanswered request is withdrawn
    assert!(!dir.path().join(layout_request_key("Fluid", "Solid", 1)).exists());
}

#[test]
fn test_stale_layout_entries_are_ignored() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    // Leftovers of an earlier run that died during its master phase
    let stale = [
        (layout_key("Solid", "Fluid", 1), "1 0f0f0f0f"),
        (layout_request_key("Solid", "Fluid", 1), "0f0f0f0f"),
        (layout_key("Fluid", "Solid", 1), "7 abcdef"),
        (layout_key("Fluid", "Solid", 2), "7"),
    ];
    for (key, value) in &stale {
        std::fs::write(dir.path().join(key), value).unwrap();
    }
    let factory = factory(dir.path(), Duration::from_secs(20));

    let mut handles = Vec::new();
    for (name, remote, size, accept) in [("Fluid", "Solid", 3, true), ("Solid", "Fluid", 2, false)] {
        for rank in 0..size {
            let factory = Arc::clone(&factory);
            handles.push(thread::spawn(move || {
                let mut m2n = connect(&factory, name, remote, rank, size, accept);
                let remote_size = m2n.remote_size();
                m2n.close_connection().unwrap();
                (name, remote_size)
            }));
        }
    }

    for handle in handles {
        match handle.join().unwrap() {
            ("Fluid", remote_size) => assert_eq!(remote_size, Some(2)),
            (_, remote_size) => assert_eq!(remote_size, Some(3)),
        }
    }
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_layout_waits_for_this_run_of_the_master() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(layout_key("Fluid", "Solid", 1)), "5 0123456789").unwrap();
    let factory = factory(dir.path(), Duration::from_millis(300));
    let mut m2n = M2N::with_factory(LocalGroup::new("Fluid", 1, 2).unwrap(), "Solid", factory);

    // Without a live master the old answer is not taken
    let err = m2n.accept_master_connection().unwrap_err();
    assert_eq!(err.code(), Code::Connection);
    assert_eq!(m2n.remote_size(), None);
}

#[test]
fn test_local_group_validation() {
    assert!(LocalGroup::new("Fluid", 0, 1).unwrap().is_master());
    assert!(!LocalGroup::new("Fluid", 2, 3).unwrap().is_master());
    assert_eq!(LocalGroup::new("Fluid", 3, 3).unwrap_err().code(), Code::Configuration);
    assert_eq!(LocalGroup::new("Fluid", -1, 3).unwrap_err().code(), Code::Configuration);
    assert_eq!(LocalGroup::new("Fluid", 0, 0).unwrap_err().code(), Code::Configuration);
    assert_eq!(LocalGroup::new("", 0, 1).unwrap_err().code(), Code::Configuration);
}

#[test]
fn test_drop_closes_connection() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(dir.path(), Duration::from_secs(20));

    let requester_factory = Arc::clone(&factory);
    let requester = thread::spawn(move || {
        let mut m2n = connect(&requester_factory, "Solid", "Fluid", 0, 1, false);
        m2n.communication(0).unwrap().receive_int(0)
    });

    let m2n = connect(&factory, "Fluid", "Solid", 0, 1, true);
    drop(m2n);

    let err = requester.join().unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Transport);
}
