//! One framed, padded, sealed message on a tunnel stream.
//!
//! ```plain
//! +-------------+------------------+----------------+--------+---------+
//! | Pack Length | Confusion Length | Confusion Data |  Type  | Payload |
//! +-------------+------------------+----------------+--------+---------+
//! |    2 LE     |       2 LE       |    = ConfLen   |   1    |  rest   |
//! +-------------+------------------+----------------+--------+---------+
//! ```
//!
//! Everything from Confusion Length onward is sealed as one AEAD envelope;
//! Pack Length is the envelope's length. The confusion bytes are fresh
//! random padding on every send and are never inspected on receive.

use std::io::ErrorKind;

use num_enum::{FromPrimitive, IntoPrimitive};
use rand::{Rng, RngCore};
use snafu::{IntoError, ResultExt, ensure};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
	Error, IoSnafu, MalformedSnafu, PackTooLongSnafu, StreamClosedSnafu, UnknownFrameTypeSnafu,
	cipher::AesGcmCipher,
};

/// Largest payload a single frame carries; also the relay read-buffer size.
pub const READBUFF_SIZE: usize = 32 * 1024;

/// Confusion padding bounds, half-open.
pub const CONFUSION_MIN: usize = 100;
pub const CONFUSION_MAX: usize = 1000;

/// Largest sealed envelope a peer may announce: a full read buffer plus
/// maximal confusion, its two length bytes, and the AEAD overhead. Anything
/// longer is a protocol violation and must be rejected before allocating.
pub const PACK_MAX_LEN: usize = READBUFF_SIZE + CONFUSION_MAX + 30;

#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
	/// Carries the `host:port` the peer should dial.
	Link = 0x01,
	/// Carries relayed bytes.
	Copy = 0x02,
	#[num_enum(catch_all)]
	Other(u8),
}

/// Seal and write one frame. The whole frame goes out as a single write.
pub async fn send_frame<W>(
	writer: &mut W,
	cipher: &AesGcmCipher,
	frame_type: FrameType,
	payload: &[u8],
) -> Result<(), Error>
where
	W: AsyncWrite + Unpin + ?Sized,
{
	debug_assert!(payload.len() <= READBUFF_SIZE);

	let confusion_len = rand::rng().random_range(CONFUSION_MIN..CONFUSION_MAX);

	let mut plain = vec![0u8; 2 + confusion_len + 1 + payload.len()];
	plain[..2].copy_from_slice(&(confusion_len as u16).to_le_bytes());
	rand::rng().fill_bytes(&mut plain[2..2 + confusion_len]);
	plain[2 + confusion_len] = frame_type.into();
	plain[2 + confusion_len + 1..].copy_from_slice(payload);

	let envelope = cipher.encode(&plain)?;
	debug_assert!(envelope.len() <= PACK_MAX_LEN);

	let mut wire = Vec::with_capacity(2 + envelope.len());
	wire.extend_from_slice(&(envelope.len() as u16).to_le_bytes());
	wire.extend_from_slice(&envelope);

	writer.write_all(&wire).await.context(IoSnafu)?;
	writer.flush().await.context(IoSnafu)?;
	Ok(())
}

/// Read and open one frame.
///
/// EOF on the length prefix means the peer is done and maps to
/// [`Error::StreamClosed`]; an announced length above [`PACK_MAX_LEN`] is
/// rejected without reading the body, and a type byte outside the known set
/// is rejected after opening the envelope.
pub async fn read_frame<R>(
	reader: &mut R,
	cipher: &AesGcmCipher,
) -> Result<(FrameType, Vec<u8>), Error>
where
	R: AsyncRead + Unpin + ?Sized,
{
	let mut len_buf = [0u8; 2];
	if let Err(err) = reader.read_exact(&mut len_buf).await {
		if err.kind() == ErrorKind::UnexpectedEof {
			return StreamClosedSnafu.fail();
		}
		return Err(IoSnafu.into_error(err));
	}

	let pack_len = u16::from_le_bytes(len_buf) as usize;
	ensure!(pack_len <= PACK_MAX_LEN, PackTooLongSnafu { length: pack_len });

	let mut envelope = vec![0u8; pack_len];
	reader.read_exact(&mut envelope).await.context(IoSnafu)?;

	let plain = cipher.decode(&envelope)?;

	// u16 confusion length, the padding itself, one type byte
	ensure!(plain.len() >= 3, MalformedSnafu { len: plain.len() });
	let confusion_len = u16::from_le_bytes([plain[0], plain[1]]) as usize;
	ensure!(
		2 + confusion_len + 1 <= plain.len(),
		MalformedSnafu { len: plain.len() }
	);

	let frame_type = FrameType::from(plain[2 + confusion_len]);
	if let FrameType::Other(value) = frame_type {
		return UnknownFrameTypeSnafu { value }.fail();
	}
	let payload = plain[2 + confusion_len + 1..].to_vec();
	Ok((frame_type, payload))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cipher::OVERHEAD;

	fn cipher() -> AesGcmCipher {
		AesGcmCipher::new(b"password")
	}

	async fn roundtrip(frame_type: FrameType, payload: &[u8]) -> (FrameType, Vec<u8>) {
		let cipher = cipher();
		let mut wire = Vec::new();
		send_frame(&mut wire, &cipher, frame_type, payload).await.unwrap();

		// 2-byte prefix + envelope(2 + confusion + 1 + payload)
		let min = 2 + OVERHEAD + 2 + CONFUSION_MIN + 1 + payload.len();
		let max = 2 + OVERHEAD + 2 + (CONFUSION_MAX - 1) + 1 + payload.len();
		assert!(wire.len() >= min && wire.len() <= max, "wire {} not in [{min}, {max}]", wire.len());

		read_frame(&mut wire.as_slice(), &cipher).await.unwrap()
	}

	#[tokio::test]
	async fn link_frame_roundtrip() {
		let (frame_type, payload) = roundtrip(FrameType::Link, b"example.com:80").await;
		assert_eq!(frame_type, FrameType::Link);
		assert_eq!(payload, b"example.com:80");
	}

	#[tokio::test]
	async fn copy_frame_roundtrip() {
		let data: Vec<u8> = (0..READBUFF_SIZE).map(|i| i as u8).collect();
		let (frame_type, payload) = roundtrip(FrameType::Copy, &data).await;
		assert_eq!(frame_type, FrameType::Copy);
		assert_eq!(payload, data);
	}

	#[tokio::test]
	async fn empty_payload_is_legal() {
		let (frame_type, payload) = roundtrip(FrameType::Copy, b"").await;
		assert_eq!(frame_type, FrameType::Copy);
		assert!(payload.is_empty());
	}

	#[tokio::test]
	async fn identical_sends_differ_on_the_wire() {
		let cipher = cipher();
		let mut first = Vec::new();
		let mut second = Vec::new();
		send_frame(&mut first, &cipher, FrameType::Copy, b"hello").await.unwrap();
		send_frame(&mut second, &cipher, FrameType::Copy, b"hello").await.unwrap();
		assert_ne!(first, second);
	}

	#[tokio::test]
	async fn oversized_length_rejected_without_reading_body() {
		let cipher = cipher();
		// a forged prefix announcing more than the protocol maximum, body absent
		for length in [34000u16, u16::MAX] {
			let wire = length.to_le_bytes();
			let err = read_frame(&mut wire.as_slice(), &cipher).await.unwrap_err();
			assert!(matches!(err, Error::PackTooLong { length: l, .. } if l == length as usize));
		}
	}

	#[tokio::test]
	async fn flipped_bit_fails_auth() {
		let cipher = cipher();
		let mut wire = Vec::new();
		send_frame(&mut wire, &cipher, FrameType::Copy, b"sensitive").await.unwrap();
		let mid = 2 + (wire.len() - 2) / 2;
		wire[mid] ^= 0x80;
		assert!(matches!(
			read_frame(&mut wire.as_slice(), &cipher).await.unwrap_err(),
			Error::AuthFailed { .. }
		));
	}

	#[tokio::test]
	async fn unknown_type_byte_rejected() {
		let cipher = cipher();
		// hand-sealed frame whose type byte is neither LINK nor COPY
		let mut plain = vec![0u8; 2 + 4 + 1 + 3];
		plain[..2].copy_from_slice(&4u16.to_le_bytes());
		plain[2 + 4] = 0xab;
		let envelope = cipher.encode(&plain).unwrap();

		let mut wire = Vec::new();
		wire.extend_from_slice(&(envelope.len() as u16).to_le_bytes());
		wire.extend_from_slice(&envelope);

		assert!(matches!(
			read_frame(&mut wire.as_slice(), &cipher).await.unwrap_err(),
			Error::UnknownFrameType { value: 0xab, .. }
		));
	}

	#[tokio::test]
	async fn eof_before_prefix_is_stream_closed() {
		let cipher = cipher();
		let mut empty: &[u8] = &[];
		assert!(matches!(
			read_frame(&mut empty, &cipher).await.unwrap_err(),
			Error::StreamClosed
		));
	}
}
