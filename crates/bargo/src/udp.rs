//! The UDP relay service.
//!
//! One shared datagram socket per role. Every `(client address, destination)`
//! pair gets its own connected upstream socket plus a reader task for the
//! return path; the flow map tolerates concurrent removal because the reader
//! owns the socket it drains.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bargo_bars::{
	cipher::{AesGcmCipher, OVERHEAD},
	frame::READBUFF_SIZE,
};
use bargo_core::{debug, info, task::spawn_logged};
use bargo_socks::udp::parse_datagram;
use dashmap::DashMap;
use eyre::{Context, eyre};
use tokio::{
	net::{UdpSocket, lookup_host},
	time::timeout,
};

use crate::conf::Config;

/// A flow whose upstream stays quiet this long is reaped.
const FLOW_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

type FlowKey = (SocketAddr, String);

pub struct UdpService {
	cfg:    Arc<Config>,
	cipher: Arc<AesGcmCipher>,
	flows:  Arc<DashMap<FlowKey, Arc<UdpSocket>>>,
}

impl UdpService {
	pub fn new(cfg: Arc<Config>, cipher: Arc<AesGcmCipher>) -> Self {
		Self {
			cfg,
			cipher,
			flows: Arc::new(DashMap::new()),
		}
	}

	fn listen_addr(&self) -> String {
		if self.cfg.is_client() {
			self.cfg.socks_listen_addr()
		} else {
			self.cfg.server_listen_addr()
		}
	}

	/// Receive loop. Each datagram is handled on its own task with a copy
	/// of the bytes; receive errors are logged and skipped.
	pub async fn run(&self) -> eyre::Result<()> {
		let listen_addr = self.listen_addr();
		let listener = Arc::new(
			UdpSocket::bind(&listen_addr)
				.await
				.wrap_err_with(|| format!("failed to bind udp service on {listen_addr}"))?,
		);
		info!(target: "[UDP]", "{} listening on {}", self.cfg.mode, listen_addr);

		// the server receives sealed datagrams, which carry the AEAD overhead
		let mut buf = if self.cfg.is_client() {
			vec![0u8; READBUFF_SIZE]
		} else {
			vec![0u8; READBUFF_SIZE + OVERHEAD]
		};

		loop {
			let (read, peer) = match listener.recv_from(&mut buf).await {
				Ok(received) => received,
				Err(err) => {
					debug!(target: "[UDP]", "recv failed: {err}");
					continue;
				}
			};

			let datagram = buf[..read].to_vec();
			let cfg = self.cfg.clone();
			let cipher = self.cipher.clone();
			let flows = self.flows.clone();
			let listener = listener.clone();
			spawn_logged("udp datagram", async move {
				if let Err(err) = handle_datagram(cfg, cipher, flows, listener, datagram, peer).await {
					debug!(target: "[UDP]", "datagram from {peer} dropped: {err:#}");
				}
			});
		}
	}
}

async fn handle_datagram(
	cfg: Arc<Config>,
	cipher: Arc<AesGcmCipher>,
	flows: Arc<DashMap<FlowKey, Arc<UdpSocket>>>,
	listener: Arc<UdpSocket>,
	data: Vec<u8>,
	peer: SocketAddr,
) -> eyre::Result<()> {
	// only plaintext SOCKS5 datagrams past this point
	let data = if cfg.is_client() {
		data
	} else {
		cipher.decode(&data)?
	};

	let parsed = parse_datagram(&data)?;
	let dst = parsed.target.to_string();
	let key = (peer, dst.clone());

	let cached = flows.get(&key).map(|entry| entry.value().clone());
	let upstream = match cached {
		Some(socket) => socket,
		None => {
			let remote = if cfg.is_client() { cfg.server_addr() } else { dst };
			let socket = Arc::new(dial_udp(&remote).await?);
			flows.insert(key.clone(), socket.clone());

			spawn_logged(
				"udp flow reader",
				flow_reader(
					cfg.is_client(),
					cipher.clone(),
					flows,
					listener,
					socket.clone(),
					key,
					peer,
					parsed.header.to_vec(),
				),
			);
			socket
		}
	};

	if cfg.is_client() {
		// the whole SOCKS5 datagram, header included, goes through sealed
		let sealed = cipher.encode(&data)?;
		upstream.send(&sealed).await?;
	} else {
		upstream.send(parsed.payload).await?;
	}
	Ok(())
}

/// Connect a fresh upstream socket, binding in the family of the remote.
async fn dial_udp(remote: &str) -> eyre::Result<UdpSocket> {
	let resolved = lookup_host(remote)
		.await
		.wrap_err_with(|| format!("failed to resolve {remote}"))?
		.next()
		.ok_or_else(|| eyre!("no address found for {remote}"))?;

	let bind_addr = if resolved.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
	let socket = UdpSocket::bind(bind_addr).await?;
	socket.connect(resolved).await?;
	Ok(socket)
}

/// Removes a flow map entry when dropped, so the slot is reclaimed on every
/// exit path of the reader, unwinds included.
struct FlowGuard {
	flows: Arc<DashMap<FlowKey, Arc<UdpSocket>>>,
	key:   FlowKey,
}

impl Drop for FlowGuard {
	fn drop(&mut self) {
		self.flows.remove(&self.key);
	}
}

/// Return path of one flow. Owns the upstream socket; the guard removes the
/// flow map entry on the way out whatever the exit reason.
#[allow(clippy::too_many_arguments)]
async fn flow_reader(
	is_client: bool,
	cipher: Arc<AesGcmCipher>,
	flows: Arc<DashMap<FlowKey, Arc<UdpSocket>>>,
	listener: Arc<UdpSocket>,
	upstream: Arc<UdpSocket>,
	key: FlowKey,
	peer: SocketAddr,
	header: Vec<u8>,
) {
	let guard = FlowGuard { flows, key };

	let mut buf = if is_client {
		vec![0u8; READBUFF_SIZE + OVERHEAD]
	} else {
		vec![0u8; READBUFF_SIZE]
	};

	let outcome: eyre::Result<()> = async {
		loop {
			let read = timeout(FLOW_IDLE_TIMEOUT, upstream.recv(&mut buf))
				.await
				.map_err(|_| eyre!("flow idle"))??;

			let reply = if is_client {
				// sealed full SOCKS5 datagram from the server, relay as-is
				cipher.decode(&buf[..read])?
			} else {
				// replay the request header in front of the origin's bytes
				let mut datagram = Vec::with_capacity(header.len() + read);
				datagram.extend_from_slice(&header);
				datagram.extend_from_slice(&buf[..read]);
				cipher.encode(&datagram)?
			};

			listener.send_to(&reply, peer).await?;
		}
	}
	.await;

	if let Err(err) = outcome {
		debug!(target: "[UDP]", "flow {:?} closed: {err:#}", guard.key);
	}
}
