//! The TCP relay service.
//!
//! The client role accepts SOCKS5 connections and opens one tunnel
//! connection per flow; the server role accepts tunnel connections and
//! dials the requested origin. Both sides then hand the pair of sockets to
//! the bidirectional pipe.

use std::{sync::Arc, time::Duration};

use bargo_bars::{
	cipher::AesGcmCipher,
	frame::{FrameType, read_frame, send_frame},
	pipe::pipe,
};
use bargo_core::{debug, info, task::spawn_logged};
use bargo_socks::server;
use eyre::{Context, ensure, eyre};
use tokio::{
	net::{TcpListener, TcpStream},
	time::timeout,
};

use crate::conf::Config;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TcpService {
	cfg:    Arc<Config>,
	cipher: Arc<AesGcmCipher>,
}

impl TcpService {
	pub fn new(cfg: Arc<Config>, cipher: Arc<AesGcmCipher>) -> Self {
		Self { cfg, cipher }
	}

	fn listen_addr(&self) -> String {
		if self.cfg.is_client() {
			self.cfg.socks_listen_addr()
		} else {
			self.cfg.server_listen_addr()
		}
	}

	/// Accept loop. Never returns except on bind failure; per-connection
	/// errors only end their own flow.
	pub async fn run(&self) -> eyre::Result<()> {
		let listen_addr = self.listen_addr();
		let listener = TcpListener::bind(&listen_addr)
			.await
			.wrap_err_with(|| format!("failed to bind tcp service on {listen_addr}"))?;
		info!(target: "[TCP]", "{} listening on {}", self.cfg.mode, listen_addr);

		loop {
			let (conn, peer) = match listener.accept().await {
				Ok(accepted) => accepted,
				Err(err) => {
					debug!(target: "[TCP]", "accept failed: {err}");
					continue;
				}
			};

			let cfg = self.cfg.clone();
			let cipher = self.cipher.clone();
			spawn_logged("tcp flow", async move {
				let outcome = if cfg.is_client() {
					handle_client(cfg, cipher, conn).await
				} else {
					handle_server(cfg, cipher, conn).await
				};
				if let Err(err) = outcome {
					debug!(target: "[TCP]", "flow from {peer} ended: {err:#}");
				}
			});
		}
	}
}

/// SOCKS5 in, tunnel out.
async fn handle_client(
	cfg: Arc<Config>,
	cipher: Arc<AesGcmCipher>,
	mut conn: TcpStream,
) -> eyre::Result<()> {
	let udp_port = cfg.socks_port()?;
	let requested = server::handle_request(udp_port, &mut conn).await?;

	let mut remote = timeout(DIAL_TIMEOUT, TcpStream::connect(cfg.server_addr()))
		.await
		.map_err(|_| eyre!("dialing {} timed out", cfg.server_addr()))?
		.wrap_err_with(|| format!("failed to dial {}", cfg.server_addr()))?;

	send_frame(
		&mut remote,
		&cipher,
		FrameType::Link,
		requested.to_string().as_bytes(),
	)
	.await?;
	server::reply_tcp_ok(&mut conn).await?;

	debug!(target: "[TCP-IN]", "link {requested}");
	pipe(conn, remote, cipher).await?;
	Ok(())
}

/// Tunnel in, origin out. The first frame must be a LINK naming the origin.
async fn handle_server(
	_cfg: Arc<Config>,
	cipher: Arc<AesGcmCipher>,
	mut conn: TcpStream,
) -> eyre::Result<()> {
	let (frame_type, payload) = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut conn, &cipher))
		.await
		.map_err(|_| eyre!("no link frame within the deadline"))??;
	ensure!(
		frame_type == FrameType::Link,
		"first frame must be LINK, got {frame_type:?}"
	);

	let target = String::from_utf8(payload).wrap_err("link payload is not utf-8")?;
	let origin = timeout(DIAL_TIMEOUT, TcpStream::connect(target.as_str()))
		.await
		.map_err(|_| eyre!("dialing {target} timed out"))?
		.wrap_err_with(|| format!("failed to dial {target}"))?;

	debug!(target: "[TCP-OUT]", "link {target}");
	pipe(origin, conn, cipher).await?;
	Ok(())
}
