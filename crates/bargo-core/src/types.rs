use std::{
	fmt,
	net::{Ipv4Addr, Ipv6Addr},
};

use serde::{Deserialize, Serialize};

/// A proxy destination as requested by the client.
///
/// The `Display` form is the `host:port` text carried inside LINK frames.
/// IPv6 literals are bracketed so the string dials cleanly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetAddr {
	Domain(String, u16),
	IPv4(Ipv4Addr, u16),
	IPv6(Ipv6Addr, u16),
}

impl TargetAddr {
	pub fn port(&self) -> u16 {
		match self {
			TargetAddr::Domain(_, port) => *port,
			TargetAddr::IPv4(_, port) => *port,
			TargetAddr::IPv6(_, port) => *port,
		}
	}
}

impl fmt::Display for TargetAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
			TargetAddr::IPv4(ip, port) => write!(f, "{ip}:{port}"),
			TargetAddr::IPv6(ip, port) => write!(f, "[{ip}]:{port}"),
		}
	}
}
