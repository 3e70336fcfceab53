//! SOCKS5 plumbing for the proxy front-end: the server-side handshake the
//! TCP service speaks to user applications, the UDP datagram header codec
//! used by the UDP relay, and a small SOCKS5 client the HTTP front-end uses
//! to reach the local SOCKS service.

use std::{backtrace::Backtrace, string::FromUtf8Error};

use snafu::prelude::*;

pub mod client;
pub mod server;
pub mod udp;

pub const SOCKS_VERSION: u8 = 0x05;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("unsupported socks version {current}"))]
	VersionDismatch {
		current:   u8,
		backtrace: Backtrace,
	},
	#[snafu(display("unsupported socks command {cmd:#04x}"))]
	UnsupportedCommand {
		cmd:       u8,
		backtrace: Backtrace,
	},
	#[snafu(display("unknown address type {value}"))]
	UnknownAddressType {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("peer offered no acceptable authentication method"))]
	NoAcceptableMethod {
		backtrace: Backtrace,
	},
	FailParseDomain {
		source:    FromUtf8Error,
		backtrace: Backtrace,
	},
	#[snafu(display("fragmented udp datagram (frag {frag})"))]
	FragmentedDatagram {
		frag:      u8,
		backtrace: Backtrace,
	},
	#[snafu(display("udp datagram too short ({len} bytes)"))]
	DatagramTooShort {
		len:       usize,
		backtrace: Backtrace,
	},
	#[snafu(display("socks connect refused (reply {reply:#04x})"))]
	ConnectRefused {
		reply:     u8,
		backtrace: Backtrace,
	},
	// The client closed the control connection of a UDP association
	AssociationEnded,
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}
