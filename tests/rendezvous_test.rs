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

//! Rendezvous store tests

use cosim_com::error::Code;
use cosim_com::net::rendezvous::{
    address_key, layout_key, layout_request_key, master_channel_name, participant_name,
};
use cosim_com::net::{FileRendezvous, MemoryRendezvous, RendezvousStore};

// =========================================================================
// Key Tests
// =========================================================================

#[test]
fn test_address_key_format() {
    assert_eq!(address_key("Fluid", "Solid", 0), "Fluid-Solid_0.address");
    assert_eq!(address_key("Fluid", "Solid.master", 3), "Fluid-Solid.master_3.address");
}

#[test]
fn test_layout_key_format() {
    assert_eq!(layout_key("Fluid", "Solid", 2), "Fluid-Solid_2.layout");
    assert_eq!(layout_request_key("Fluid", "Solid", 2), "Fluid-Solid_2.layout-request");
    assert_ne!(layout_key("Fluid", "Solid", 1), layout_key("Solid", "Fluid", 1));
}

#[test]
fn test_master_channel_name() {
    let master = master_channel_name("Solid");
    assert_eq!(master, "Solid.master");
    assert_ne!(address_key("Fluid", &master, 0), address_key("Fluid", "Solid", 0));
    assert_eq!(participant_name(&master), "Solid");
    assert_eq!(participant_name("Solid"), "Solid");
}

// =========================================================================
// FileRendezvous Tests
// =========================================================================

#[test]
fn test_file_publish_lookup_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRendezvous::new(dir.path()).unwrap();
    let key = address_key("Fluid", "Solid", 1);

    assert_eq!(store.lookup(&key).unwrap(), None);
    store.publish(&key, "127.0.0.1:4242").unwrap();
    assert_eq!(store.lookup(&key).unwrap().as_deref(), Some("127.0.0.1:4242"));
    assert!(store.path_for(&key).exists());

    store.publish(&key, "127.0.0.1:4343").unwrap();
    assert_eq!(store.lookup(&key).unwrap().as_deref(), Some("127.0.0.1:4343"));

    store.remove(&key).unwrap();
    assert_eq!(store.lookup(&key).unwrap(), None);
    // Removing twice is fine
    store.remove(&key).unwrap();
}

#[test]
fn test_file_publish_leaves_no_staging_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRendezvous::new(dir.path()).unwrap();
    store.publish("Fluid-Solid_0.address", "127.0.0.1:1").unwrap();

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["Fluid-Solid_0.address".to_string()]);
}

#[test]
fn test_file_empty_entry_is_not_published() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRendezvous::new(dir.path()).unwrap();
    std::fs::write(store.path_for("partial"), "").unwrap();
    assert_eq!(store.lookup("partial").unwrap(), None);
}

#[test]
fn test_file_creates_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("run").join("addresses");
    let store = FileRendezvous::new(&nested).unwrap();
    assert!(nested.is_dir());
    assert_eq!(store.directory(), nested.as_path());
}

#[test]
fn test_file_directory_is_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("occupied");
    std::fs::write(&file, "x").unwrap();

    let err = FileRendezvous::new(&file).unwrap_err();
    assert_eq!(err.code(), Code::Configuration);
}

#[test]
fn test_file_empty_path_is_working_directory() {
    let store = FileRendezvous::new("").unwrap();
    assert_eq!(store.directory(), std::path::Path::new("."));
}

// =========================================================================
// MemoryRendezvous Tests
// =========================================================================

#[test]
fn test_memory_store() {
    let store = MemoryRendezvous::new();
    assert!(store.is_empty());

    store.publish("a", "1").unwrap();
    store.publish("b", "2").unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.lookup("a").unwrap().as_deref(), Some("1"));

    store.remove("a").unwrap();
    store.remove("a").unwrap();
    assert_eq!(store.lookup("a").unwrap(), None);
    assert_eq!(store.len(), 1);
}
