//! A minimal SOCKS5 client: enough for the HTTP front-end to push CONNECT
//! traffic through the local SOCKS service.

use std::{
	net::{Ipv4Addr, Ipv6Addr},
	time::Duration,
};

use bargo_core::AbstractTcpStream;
use snafu::{IntoError, ResultExt, ensure};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::TcpStream,
	time::timeout,
};

use crate::{
	ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, ConnectRefusedSnafu, Error, IoSnafu,
	NoAcceptableMethodSnafu, SOCKS_VERSION, VersionDismatchSnafu,
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `socks_addr` and negotiate a CONNECT to `host:port`.
pub async fn connect(socks_addr: &str, host: &str, port: u16) -> Result<TcpStream, Error> {
	let mut stream = timeout(DIAL_TIMEOUT, TcpStream::connect(socks_addr))
		.await
		.map_err(|_| {
			IoSnafu
				.into_error(std::io::Error::new(std::io::ErrorKind::TimedOut, "socks dial timed out"))
		})?
		.context(IoSnafu)?;
	handshake(&mut stream, host, port).await?;
	Ok(stream)
}

/// Run the client half of the handshake on an established stream.
pub async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Error>
where
	S: AbstractTcpStream + ?Sized,
{
	stream
		.write_all(&[SOCKS_VERSION, 0x01, 0x00])
		.await
		.context(IoSnafu)?;

	let mut method = [0u8; 2];
	stream.read_exact(&mut method).await.context(IoSnafu)?;
	ensure!(
		method[0] == SOCKS_VERSION,
		VersionDismatchSnafu { current: method[0] }
	);
	ensure!(method[1] == 0x00, NoAcceptableMethodSnafu);

	stream
		.write_all(&encode_connect(host, port))
		.await
		.context(IoSnafu)?;

	let mut reply = [0u8; 10];
	stream.read_exact(&mut reply).await.context(IoSnafu)?;
	ensure!(reply[1] == 0x00, ConnectRefusedSnafu { reply: reply[1] });

	Ok(())
}

/// Build the CONNECT request. The address type follows the shape of the
/// host: a dotted quad goes as IPv4, anything with a colon as IPv6, the
/// rest as a domain name.
fn encode_connect(host: &str, port: u16) -> Vec<u8> {
	let mut request = Vec::with_capacity(4 + host.len() + 3);
	request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);

	let literal = host.trim_matches(|c| c == '[' || c == ']');
	if let Ok(ip) = literal.parse::<Ipv4Addr>() {
		request.push(ATYP_IPV4);
		request.extend_from_slice(&ip.octets());
	} else if let Ok(ip) = literal.parse::<Ipv6Addr>() {
		request.push(ATYP_IPV6);
		request.extend_from_slice(&ip.octets());
	} else {
		request.push(ATYP_DOMAIN);
		request.push(host.len() as u8);
		request.extend_from_slice(host.as_bytes());
	}

	request.extend_from_slice(&port.to_be_bytes());
	request
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	use super::{encode_connect, handshake};
	use crate::Error;

	#[test]
	fn address_type_follows_host_shape() {
		let v4 = encode_connect("1.2.3.4", 80);
		assert_eq!(&v4[3..], &[0x01, 1, 2, 3, 4, 0, 80]);

		let v6 = encode_connect("::1", 80);
		assert_eq!(v6[3], 0x04);
		assert_eq!(v6.len(), 4 + 16 + 2);

		let domain = encode_connect("example.com", 8080);
		assert_eq!(domain[3], 0x03);
		assert_eq!(domain[4], 11);
		assert_eq!(&domain[5..16], b"example.com");
		assert_eq!(&domain[16..], &8080u16.to_be_bytes());
	}

	#[tokio::test]
	async fn handshake_against_scripted_server() {
		let (mut client, mut server) = duplex(512);
		let task = tokio::spawn(async move { handshake(&mut client, "example.com", 80).await });

		let mut greeting = [0u8; 3];
		server.read_exact(&mut greeting).await.unwrap();
		assert_eq!(greeting, [0x05, 0x01, 0x00]);
		server.write_all(&[0x05, 0x00]).await.unwrap();

		let mut request = [0u8; 18];
		server.read_exact(&mut request).await.unwrap();
		assert_eq!(&request[..5], &[0x05, 0x01, 0x00, 0x03, 11]);
		server
			.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
			.await
			.unwrap();

		task.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn nonzero_reply_is_refused() {
		let (mut client, mut server) = duplex(512);
		let task = tokio::spawn(async move { handshake(&mut client, "example.com", 80).await });

		let mut greeting = [0u8; 3];
		server.read_exact(&mut greeting).await.unwrap();
		server.write_all(&[0x05, 0x00]).await.unwrap();

		let mut request = [0u8; 18];
		server.read_exact(&mut request).await.unwrap();
		server
			.write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
			.await
			.unwrap();

		assert!(matches!(
			task.await.unwrap().unwrap_err(),
			Error::ConnectRefused { reply: 0x05, .. }
		));
	}
}
