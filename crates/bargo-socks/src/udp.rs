//! RFC 1928 §7 UDP request header codec.
//!
//! ```plain
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```
//!
//! Fragmented datagrams (`FRAG != 0`) are not supported and rejected.

use std::net::{Ipv4Addr, Ipv6Addr};

use bargo_core::types::TargetAddr;
use snafu::ensure;

use crate::{
	ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, DatagramTooShortSnafu, Error, FragmentedDatagramSnafu,
	UnknownAddressTypeSnafu,
};

/// A parsed SOCKS5 UDP datagram, borrowing the raw bytes.
///
/// `header` is the exact prefix to replay in front of reply payloads;
/// `payload` is everything after it.
#[derive(Debug)]
pub struct UdpDatagram<'a> {
	pub target:  TargetAddr,
	pub header:  &'a [u8],
	pub payload: &'a [u8],
}

pub fn parse_datagram(data: &[u8]) -> Result<UdpDatagram<'_>, Error> {
	ensure!(data.len() >= 4, DatagramTooShortSnafu { len: data.len() });
	ensure!(data[2] == 0, FragmentedDatagramSnafu { frag: data[2] });

	let (target, header_len) = match data[3] {
		ATYP_IPV4 => {
			ensure!(data.len() >= 10, DatagramTooShortSnafu { len: data.len() });
			let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
			let port = u16::from_be_bytes([data[8], data[9]]);
			(TargetAddr::IPv4(ip, port), 10)
		}
		ATYP_DOMAIN => {
			ensure!(data.len() >= 5, DatagramTooShortSnafu { len: data.len() });
			let len = data[4] as usize;
			ensure!(data.len() >= 7 + len, DatagramTooShortSnafu { len: data.len() });
			let domain = String::from_utf8_lossy(&data[5..5 + len]).into_owned();
			let port = u16::from_be_bytes([data[5 + len], data[6 + len]]);
			(TargetAddr::Domain(domain, port), 7 + len)
		}
		ATYP_IPV6 => {
			ensure!(data.len() >= 22, DatagramTooShortSnafu { len: data.len() });
			let mut octets = [0u8; 16];
			octets.copy_from_slice(&data[4..20]);
			let port = u16::from_be_bytes([data[20], data[21]]);
			(TargetAddr::IPv6(Ipv6Addr::from(octets), port), 22)
		}
		value => return UnknownAddressTypeSnafu { value }.fail(),
	};

	Ok(UdpDatagram {
		target,
		header: &data[..header_len],
		payload: &data[header_len..],
	})
}

/// Build the header for a datagram addressed to `target`.
pub fn encode_header(target: &TargetAddr) -> Vec<u8> {
	let mut header = vec![0x00, 0x00, 0x00];
	match target {
		TargetAddr::IPv4(ip, port) => {
			header.push(ATYP_IPV4);
			header.extend_from_slice(&ip.octets());
			header.extend_from_slice(&port.to_be_bytes());
		}
		TargetAddr::Domain(domain, port) => {
			header.push(ATYP_DOMAIN);
			header.push(domain.len() as u8);
			header.extend_from_slice(domain.as_bytes());
			header.extend_from_slice(&port.to_be_bytes());
		}
		TargetAddr::IPv6(ip, port) => {
			header.push(ATYP_IPV6);
			header.extend_from_slice(&ip.octets());
			header.extend_from_slice(&port.to_be_bytes());
		}
	}
	header
}
