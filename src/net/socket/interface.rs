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

//! Network interface selection

use std::net::{IpAddr, Ipv4Addr};

use crate::error::{ComError, ComResult};

/// Resolve the address to listen on for a network interface name
///
/// Accepts `lo`/`localhost`, `any` for all interfaces, an IPv4 literal, or
/// the name of a local interface carrying an IPv4 address.
pub fn resolve_interface(network: &str) -> ComResult<IpAddr> {
    let network = network.trim();
    match network {
        "lo" | "lo0" | "localhost" | "loopback" => return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        "any" => return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        _ => {}
    }
    if let Ok(addr) = network.parse::<Ipv4Addr>() {
        return Ok(IpAddr::V4(addr));
    }

    match interface_ipv4(network)? {
        Some(addr) => {
            log::debug!("Interface {} has address {}", network, addr);
            Ok(IpAddr::V4(addr))
        }
        None => Err(ComError::Configuration(format!(
            "network interface {} does not exist or has no IPv4 address",
            network
        ))),
    }
}

#[cfg(unix)]
fn interface_ipv4(name: &str) -> ComResult<Option<Ipv4Addr>> {
    use std::ffi::CStr;

    let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `addrs` with a list that is released below.
    if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
        return Err(ComError::Configuration(format!(
            "cannot list network interfaces: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut found = None;
    let mut cursor = addrs;
    while !cursor.is_null() {
        // SAFETY: cursor walks the list returned by getifaddrs.
        let entry = unsafe { &*cursor };
        if !entry.ifa_addr.is_null() && !entry.ifa_name.is_null() {
            let ifname = unsafe { CStr::from_ptr(entry.ifa_name) };
            let family = unsafe { (*entry.ifa_addr).sa_family } as i32;
            if ifname.to_bytes() == name.as_bytes() && family == libc::AF_INET {
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
                break;
            }
        }
        cursor = entry.ifa_next;
    }

    // SAFETY: addrs came from a successful getifaddrs call.
    unsafe { libc::freeifaddrs(addrs) };
    Ok(found)
}

#[cfg(not(unix))]
fn interface_ipv4(_name: &str) -> ComResult<Option<Ipv4Addr>> {
    Ok(None)
}
