//! Local interface enumeration and change detection.

use std::collections::BTreeSet;
use std::net::IpAddr;

/// Whether `ip` is worth advertising as a local candidate.
///
/// Link-local addresses need a zone to be usable and unspecified addresses
/// are never reachable.
#[must_use]
pub fn is_usable(ip: IpAddr, include_loopback: bool) -> bool {
    if ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    if ip.is_loopback() {
        return include_loopback;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
    }
}

/// Usable addresses on all local interfaces, sorted.
///
/// Enumeration failures yield an empty list; they are logged at debug.
#[must_use]
pub fn local_addresses(include_loopback: bool) -> Vec<IpAddr> {
    snapshot(include_loopback).addrs.into_iter().collect()
}

/// Set of local interface addresses at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSnapshot {
    addrs: BTreeSet<IpAddr>,
}

impl InterfaceSnapshot {
    /// Build a snapshot from explicit addresses.
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }

    /// Addresses in the snapshot.
    pub fn addrs(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.addrs.iter().copied()
    }

    /// Whether any non-loopback IPv4 address is present.
    #[must_use]
    pub fn has_v4(&self) -> bool {
        self.addrs.iter().any(|ip| ip.is_ipv4() && !ip.is_loopback())
    }

    /// Whether any global-looking IPv6 address is present.
    #[must_use]
    pub fn has_v6(&self) -> bool {
        self.addrs.iter().any(|ip| ip.is_ipv6() && !ip.is_loopback())
    }
}

/// Take a snapshot of current interface addresses.
#[must_use]
pub fn snapshot(include_loopback: bool) -> InterfaceSnapshot {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => InterfaceSnapshot::from_addrs(
            ifaces
                .into_iter()
                .map(|iface| iface.ip())
                .filter(|ip| is_usable(*ip, include_loopback)),
        ),
        Err(e) => {
            tracing::debug!("interface enumeration failed: {e}");
            InterfaceSnapshot::default()
        }
    }
}

/// Detects interface changes between polls.
#[derive(Debug)]
pub struct LinkMonitor {
    include_loopback: bool,
    last: InterfaceSnapshot,
}

impl LinkMonitor {
    /// Create a monitor primed with the current interface state.
    #[must_use]
    pub fn new(include_loopback: bool) -> Self {
        Self {
            include_loopback,
            last: snapshot(include_loopback),
        }
    }

    /// Re-read interfaces. Returns the new snapshot if it differs.
    pub fn poll(&mut self) -> Option<InterfaceSnapshot> {
        self.observe(snapshot(self.include_loopback))
    }

    /// Compare against an externally obtained snapshot.
    pub fn observe(&mut self, current: InterfaceSnapshot) -> Option<InterfaceSnapshot> {
        if current == self.last {
            return None;
        }
        tracing::info!(
            "link change: {} -> {} interface addresses",
            self.last.addrs.len(),
            current.addrs.len()
        );
        self.last = current.clone();
        Some(current)
    }

    /// Last observed snapshot.
    #[must_use]
    pub fn current(&self) -> &InterfaceSnapshot {
        &self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_usable() {
        assert!(is_usable("192.168.1.10".parse().unwrap(), false));
        assert!(is_usable("2001:db8::1".parse().unwrap(), false));
        assert!(!is_usable("127.0.0.1".parse().unwrap(), false));
        assert!(is_usable("127.0.0.1".parse().unwrap(), true));
        assert!(!is_usable("169.254.3.4".parse().unwrap(), true));
        assert!(!is_usable("fe80::1".parse().unwrap(), true));
        assert!(!is_usable("0.0.0.0".parse().unwrap(), true));
    }

    #[test]
    fn test_link_monitor_reports_changes_once() {
        let mut monitor = LinkMonitor {
            include_loopback: false,
            last: InterfaceSnapshot::default(),
        };
        let a = InterfaceSnapshot::from_addrs(["10.0.0.2".parse().unwrap()]);
        assert_eq!(monitor.observe(a.clone()), Some(a.clone()));
        assert_eq!(monitor.observe(a.clone()), None);
        assert!(monitor.current().has_v4());
        assert!(!monitor.current().has_v6());
        assert_eq!(monitor.observe(InterfaceSnapshot::default()), Some(InterfaceSnapshot::default()));
    }

    #[test]
    fn test_local_addresses_does_not_panic() {
        for ip in local_addresses(true) {
            assert!(is_usable(ip, true));
        }
    }
}
