//! Bidirectional relay between a plaintext connection and a framed tunnel.
//!
//! Closing the sockets is the only cancellation primitive: the first worker
//! to exit reports its reason, the pipe aborts the sibling, and dropping the
//! stream halves closes both connections.

use std::{sync::Arc, time::Duration};

use bargo_core::AbstractTcpStream;
use snafu::ResultExt;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt, split},
	sync::mpsc,
	time::timeout,
};

use crate::{
	Error, IoSnafu, TypeMismatchSnafu,
	cipher::AesGcmCipher,
	frame::{FrameType, READBUFF_SIZE, read_frame, send_frame},
};

/// A stalled peer is reaped after this long without progress.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay `plain` and the framed `tunnel` until either direction ends.
///
/// Returns `Ok(())` when one side closed cleanly and the error that ended
/// the relay otherwise. Both connections are closed by the time this
/// returns.
pub async fn pipe<P, T>(plain: P, tunnel: T, cipher: Arc<AesGcmCipher>) -> Result<(), Error>
where
	P: AbstractTcpStream + 'static,
	T: AbstractTcpStream + 'static,
{
	let (mut plain_r, mut plain_w) = split(plain);
	let (mut tunnel_r, mut tunnel_w) = split(tunnel);

	// Room for both workers so neither blocks on reporting its exit.
	let (done_tx, mut done_rx) = mpsc::channel::<Result<(), Error>>(2);

	let upstream_cipher = cipher.clone();
	let upstream_tx = done_tx.clone();
	let upstream = tokio::spawn(async move {
		let mut buf = vec![0u8; READBUFF_SIZE];
		let reason = async {
			loop {
				let read = timeout(IDLE_TIMEOUT, plain_r.read(&mut buf))
					.await
					.map_err(|_| Error::IdleTimeout)?
					.context(IoSnafu)?;
				if read == 0 {
					return Ok(());
				}
				timeout(
					IDLE_TIMEOUT,
					send_frame(&mut tunnel_w, &upstream_cipher, FrameType::Copy, &buf[..read]),
				)
				.await
				.map_err(|_| Error::IdleTimeout)??;
			}
		}
		.await;
		let _ = upstream_tx.send(reason).await;
	});

	let downstream = tokio::spawn(async move {
		let reason = async {
			loop {
				let (frame_type, payload) = match timeout(IDLE_TIMEOUT, read_frame(&mut tunnel_r, &cipher)).await {
					Err(_) => return Err(Error::IdleTimeout),
					Ok(Err(Error::StreamClosed)) => return Ok(()),
					Ok(res) => res?,
				};
				if frame_type != FrameType::Copy {
					return TypeMismatchSnafu {
						expect:  FrameType::Copy,
						current: frame_type,
					}
					.fail();
				}
				timeout(IDLE_TIMEOUT, plain_w.write_all(&payload))
					.await
					.map_err(|_| Error::IdleTimeout)?
					.context(IoSnafu)?;
			}
		}
		.await;
		let _ = done_tx.send(reason).await;
	});

	// First worker to exit decides the outcome; killing the tasks drops all
	// four halves, which closes both connections and unblocks the sibling.
	let outcome = done_rx.recv().await.unwrap_or(Ok(()));
	upstream.abort();
	downstream.abort();
	outcome
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	use super::pipe;
	use crate::{
		Error,
		cipher::AesGcmCipher,
		frame::{FrameType, read_frame, send_frame},
	};

	fn cipher() -> Arc<AesGcmCipher> {
		Arc::new(AesGcmCipher::new(b"password"))
	}

	#[test_log::test(tokio::test)]
	async fn relays_and_frames_both_directions() -> eyre::Result<()> {
		let cipher = cipher();
		let (app, plain_side) = duplex(4096);
		let (tunnel_side, peer) = duplex(4096);

		let piping = tokio::spawn(pipe(plain_side, tunnel_side, cipher.clone()));

		// plaintext in -> COPY frame out
		let (mut app_r, mut app_w) = tokio::io::split(app);
		app_w.write_all(b"ping").await?;

		let (mut peer_r, mut peer_w) = tokio::io::split(peer);
		let (frame_type, payload) = read_frame(&mut peer_r, &cipher).await?;
		assert_eq!(frame_type, FrameType::Copy);
		assert_eq!(payload, b"ping");

		// COPY frame in -> plaintext out
		send_frame(&mut peer_w, &cipher, FrameType::Copy, b"pong").await?;
		let mut buf = [0u8; 4];
		app_r.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"pong");

		// closing the app side ends the pipe cleanly
		drop(app_w);
		drop(app_r);
		assert!(piping.await?.is_ok());
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn non_copy_frame_is_fatal() -> eyre::Result<()> {
		let cipher = cipher();
		let (_app, plain_side) = duplex(4096);
		let (tunnel_side, peer) = duplex(4096);

		let piping = tokio::spawn(pipe(plain_side, tunnel_side, cipher.clone()));

		let (_peer_r, mut peer_w) = tokio::io::split(peer);
		send_frame(&mut peer_w, &cipher, FrameType::Link, b"example.com:80").await?;

		assert!(matches!(
			piping.await?.unwrap_err(),
			Error::TypeMismatch { .. }
		));
		Ok(())
	}

	#[test_log::test(tokio::test)]
	async fn peer_close_tears_down() -> eyre::Result<()> {
		let cipher = cipher();
		let (app, plain_side) = duplex(4096);
		let (tunnel_side, peer) = duplex(4096);

		let piping = tokio::spawn(pipe(plain_side, tunnel_side, cipher));
		drop(peer);
		assert!(piping.await?.is_ok());
		drop(app);
		Ok(())
	}
}
