use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Relay bytes in both directions until either side reaches EOF or fails.
///
/// Returns the byte counts for each direction and the error that ended the
/// relay, if any. The caller is expected to drop both streams afterwards;
/// closing them is how the peer learns the relay is over.
pub async fn copy_io<A, B>(a: &mut A, b: &mut B) -> (usize, usize, Option<std::io::Error>)
where
	A: AsyncRead + AsyncWrite + Unpin + ?Sized,
	B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
	let mut a2b = [0u8; BUFFER_SIZE];
	let mut b2a = [0u8; BUFFER_SIZE];

	let mut a2b_num = 0;
	let mut b2a_num = 0;

	let mut last_err = None;

	loop {
		tokio::select! {
			a2b_res = a.read(&mut a2b) => match a2b_res {
				Ok(0) => {
					// EOF, tell the other side
					let _ = b.shutdown().await;
					break;
				}
				Ok(num) => {
					a2b_num += num;
					if let Err(err) = b.write_all(&a2b[..num]).await {
						last_err = Some(err);
						break;
					}
				}
				Err(err) => {
					last_err = Some(err);
					break;
				}
			},
			b2a_res = b.read(&mut b2a) => match b2a_res {
				Ok(0) => {
					let _ = a.shutdown().await;
					break;
				}
				Ok(num) => {
					b2a_num += num;
					if let Err(err) = a.write_all(&b2a[..num]).await {
						last_err = Some(err);
						break;
					}
				}
				Err(err) => {
					last_err = Some(err);
					break;
				}
			}
		}
	}

	(a2b_num, b2a_num, last_err)
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::copy_io;

	#[tokio::test]
	async fn relays_both_directions() {
		let (mut client, mut relay_a) = tokio::io::duplex(256);
		let (mut relay_b, mut server) = tokio::io::duplex(256);

		let relay = tokio::spawn(async move { copy_io(&mut relay_a, &mut relay_b).await });

		client.write_all(b"hello").await.unwrap();
		let mut buf = [0u8; 5];
		server.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"hello");

		server.write_all(b"world").await.unwrap();
		client.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"world");

		drop(client);
		let (a2b, b2a, err) = relay.await.unwrap();
		assert!(err.is_none());
		assert_eq!(a2b, 5);
		assert_eq!(b2a, 5);
	}
}
