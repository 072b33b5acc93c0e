//! C1: address resolver. Resolves a host name to an ordered set of numeric
//! endpoints via `getaddrinfo`, grounded on
//! `examples/original_source/apib/addresses.cc`.

use std::ffi::CString;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::ptr;

use crate::error::ApibError;

/// Address family hint for a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyHint {
    Any,
    V4,
    V6,
}

impl FamilyHint {
    fn as_af(self) -> libc::c_int {
        match self {
            FamilyHint::Any => libc::AF_UNSPEC,
            FamilyHint::V4 => libc::AF_INET,
            FamilyHint::V6 => libc::AF_INET6,
        }
    }
}

/// A resolved numeric address. Family + bytes + port; equality ignores
/// nothing (all three fields must match).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Unspecified,
    V4 { addr: Ipv4Addr, port: u16 },
    V6 { addr: Ipv6Addr, port: u16 },
}

impl Endpoint {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Endpoint::Unspecified)
    }

    pub fn with_port(&self, port: u16) -> Endpoint {
        match self {
            Endpoint::Unspecified => Endpoint::Unspecified,
            Endpoint::V4 { addr, .. } => Endpoint::V4 { addr: *addr, port },
            Endpoint::V6 { addr, .. } => Endpoint::V6 { addr: *addr, port },
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Unspecified => 0,
            Endpoint::V4 { port, .. } => *port,
            Endpoint::V6 { port, .. } => *port,
        }
    }

    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddr> {
        match self {
            Endpoint::Unspecified => None,
            Endpoint::V4 { addr, port } => Some((*addr, *port).into()),
            Endpoint::V6 { addr, port } => Some((*addr, *port).into()),
        }
    }
}

/// An ordered sequence of endpoints for one hostname (spec section 3).
/// Endpoint ordering follows the OS resolver and is treated as canonical for
/// round-robin selection.
#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Returns the `sequence`-th endpoint (mod length) stamped with `port`.
    /// An empty set returns the unspecified sentinel, which compares
    /// unequal to any real endpoint.
    pub fn get(&self, port: u16, sequence: usize) -> Endpoint {
        if self.endpoints.is_empty() {
            return Endpoint::Unspecified;
        }
        let ix = sequence % self.endpoints.len();
        self.endpoints[ix].with_port(port)
    }
}

/// Resolve `name` to an ordered set of endpoints. Distinguishes a DNS-layer
/// failure (`EAI_*`, not `EAI_SYSTEM`) from an OS/system failure (`errno`).
pub fn lookup(name: &str, family_hint: FamilyHint) -> Result<EndpointSet, ApibError> {
    let cname = CString::new(name).map_err(|_| ApibError::InvalidUrl(name.to_string()))?;

    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = family_hint.as_af();
    hints.ai_socktype = libc::SOCK_STREAM;
    hints.ai_flags = libc::AI_ADDRCONFIG;

    let mut results: *mut libc::addrinfo = ptr::null_mut();
    let rc = unsafe {
        libc::getaddrinfo(cname.as_ptr(), ptr::null(), &hints, &mut results)
    };

    if rc != 0 {
        if rc == libc::EAI_SYSTEM {
            let errno = std::io::Error::last_os_error();
            return Err(ApibError::DnsFailure {
                host: name.to_string(),
                detail: format!("system error: {errno}"),
            });
        }
        let msg = unsafe {
            std::ffi::CStr::from_ptr(libc::gai_strerror(rc))
                .to_string_lossy()
                .into_owned()
        };
        return Err(ApibError::DnsFailure {
            host: name.to_string(),
            detail: msg,
        });
    }

    let mut endpoints = Vec::new();
    let mut cur = results;
    while !cur.is_null() {
        let ai = unsafe { &*cur };
        if let Some(ep) = sockaddr_to_endpoint(ai.ai_addr, ai.ai_family) {
            endpoints.push(ep);
        }
        cur = ai.ai_next;
    }
    unsafe { libc::freeaddrinfo(results) };

    Ok(EndpointSet { endpoints })
}

fn sockaddr_to_endpoint(addr: *const libc::sockaddr, family: libc::c_int) -> Option<Endpoint> {
    if addr.is_null() {
        return None;
    }
    match family {
        libc::AF_INET => {
            let sin = unsafe { &*(addr as *const libc::sockaddr_in) };
            let ip = u32::from_be(sin.sin_addr.s_addr);
            let port = u16::from_be(sin.sin_port);
            Some(Endpoint::V4 {
                addr: Ipv4Addr::from(ip),
                port,
            })
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(addr as *const libc::sockaddr_in6) };
            let port = u16::from_be(sin6.sin6_port);
            Some(Endpoint::V6 {
                addr: Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                port,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_returns_unspecified_sentinel() {
        let set = EndpointSet::default();
        let ep = set.get(80, 0);
        assert!(ep.is_unspecified());
        assert_ne!(ep, Endpoint::V4 { addr: Ipv4Addr::new(1, 2, 3, 4), port: 80 });
    }

    #[test]
    fn round_robin_covers_each_endpoint_once_per_window() {
        let set = EndpointSet {
            endpoints: vec![
                Endpoint::V4 { addr: Ipv4Addr::new(1, 0, 0, 1), port: 0 },
                Endpoint::V4 { addr: Ipv4Addr::new(1, 0, 0, 2), port: 0 },
                Endpoint::V4 { addr: Ipv4Addr::new(1, 0, 0, 3), port: 0 },
            ],
        };
        let mut seen = std::collections::HashSet::new();
        for seq in 10..13 {
            seen.insert(set.get(80, seq));
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn lookup_localhost_resolves() {
        let set = lookup("localhost", FamilyHint::Any).expect("lookup should succeed");
        assert!(!set.is_empty());
    }

    #[test]
    fn lookup_invalid_host_is_dns_failure() {
        let err = lookup("this.host.does.not.exist.invalid", FamilyHint::Any);
        assert!(matches!(err, Err(ApibError::DnsFailure { .. })));
    }
}
