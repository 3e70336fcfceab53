//! Server side of the RFC 1928 handshake.
//!
//! Only `NO AUTH` is negotiated; CONNECT and UDP ASSOCIATE are the accepted
//! commands. A UDP ASSOCIATE never returns a target: the control connection
//! is held open, without any deadline, until the client drops it, which ends
//! the association.

use std::{
	net::{Ipv4Addr, Ipv6Addr},
	time::Duration,
};

use bargo_core::{AbstractTcpStream, debug, types::TargetAddr};
use snafu::{IntoError, ResultExt, ensure};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	time::timeout,
};

use crate::{
	ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AssociationEndedSnafu, CMD_CONNECT, CMD_UDP_ASSOCIATE,
	Error, FailParseDomainSnafu, IoSnafu, SOCKS_VERSION, UnknownAddressTypeSnafu,
	UnsupportedCommandSnafu, VersionDismatchSnafu,
};

/// A client that stalls mid-handshake is dropped after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

async fn read_exact_timed<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), Error>
where
	S: AbstractTcpStream + ?Sized,
{
	timeout(HANDSHAKE_TIMEOUT, stream.read_exact(buf))
		.await
		.map_err(|_| {
			IoSnafu.into_error(std::io::Error::new(
				std::io::ErrorKind::TimedOut,
				"handshake deadline elapsed",
			))
		})?
		.context(IoSnafu)?;
	Ok(())
}

/// Negotiate the authentication method down to `NO AUTH`.
async fn handle_method<S>(stream: &mut S) -> Result<(), Error>
where
	S: AbstractTcpStream + ?Sized,
{
	let mut head = [0u8; 2];
	read_exact_timed(stream, &mut head).await?;
	ensure!(head[0] == SOCKS_VERSION, VersionDismatchSnafu { current: head[0] });

	// drain the offered methods, we only ever pick NO AUTH
	let mut methods = vec![0u8; head[1] as usize];
	read_exact_timed(stream, &mut methods).await?;

	stream.write_all(&[SOCKS_VERSION, 0x00]).await.context(IoSnafu)?;
	Ok(())
}

/// Run the handshake and return the requested target of a CONNECT.
///
/// For UDP ASSOCIATE this replies with `127.0.0.1:udp_port`, then parks on
/// the control connection; the eventual return is always an error
/// ([`Error::AssociationEnded`] once the client hangs up), which makes the
/// caller tear the connection down.
pub async fn handle_request<S>(udp_port: u16, stream: &mut S) -> Result<TargetAddr, Error>
where
	S: AbstractTcpStream + ?Sized,
{
	handle_method(stream).await?;

	let mut prefix = [0u8; 4];
	read_exact_timed(stream, &mut prefix).await?;
	let cmd = prefix[1];
	let atyp = prefix[3];

	ensure!(
		cmd == CMD_CONNECT || cmd == CMD_UDP_ASSOCIATE,
		UnsupportedCommandSnafu { cmd }
	);

	if cmd == CMD_UDP_ASSOCIATE {
		return hold_udp_association(udp_port, stream).await;
	}

	let target = match atyp {
		ATYP_IPV4 => {
			let mut buf = [0u8; 6];
			read_exact_timed(stream, &mut buf).await?;
			let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
			TargetAddr::IPv4(ip, u16::from_be_bytes([buf[4], buf[5]]))
		}
		ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			read_exact_timed(stream, &mut len).await?;
			let len = len[0] as usize;
			let mut buf = vec![0u8; len + 2];
			read_exact_timed(stream, &mut buf).await?;
			let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
			buf.truncate(len);
			TargetAddr::Domain(String::from_utf8(buf).context(FailParseDomainSnafu)?, port)
		}
		ATYP_IPV6 => {
			let mut buf = [0u8; 18];
			read_exact_timed(stream, &mut buf).await?;
			let mut octets = [0u8; 16];
			octets.copy_from_slice(&buf[..16]);
			TargetAddr::IPv6(Ipv6Addr::from(octets), u16::from_be_bytes([buf[16], buf[17]]))
		}
		value => return UnknownAddressTypeSnafu { value }.fail(),
	};

	Ok(target)
}

/// Reply success to a CONNECT: `05 00 00 01 0.0.0.0:0`.
pub async fn reply_tcp_ok<S>(stream: &mut S) -> Result<(), Error>
where
	S: AbstractTcpStream + ?Sized,
{
	stream
		.write_all(&[SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
		.await
		.context(IoSnafu)
}

async fn hold_udp_association<S>(udp_port: u16, stream: &mut S) -> Result<TargetAddr, Error>
where
	S: AbstractTcpStream + ?Sized,
{
	let mut reply = [SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 0];
	reply[8..10].copy_from_slice(&udp_port.to_be_bytes());
	stream.write_all(&reply).await.context(IoSnafu)?;
	debug!(target: "[SOCKS]", "udp association relayed to port {udp_port}");

	// The association lives as long as this connection. No deadline here:
	// an idle association is legitimate.
	let mut byte = [0u8; 1];
	loop {
		match stream.read(&mut byte).await {
			Ok(0) => return AssociationEndedSnafu.fail(),
			Ok(_) => continue,
			Err(source) => return Err(source).context(IoSnafu),
		}
	}
}
