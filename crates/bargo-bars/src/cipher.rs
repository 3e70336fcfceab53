use aes_gcm::{
	Aes128Gcm, Key, Nonce,
	aead::{Aead, AeadCore, KeyInit, OsRng},
};
use md5::{Digest, Md5};
use snafu::ensure;

use crate::{AuthFailedSnafu, CipherTooShortSnafu, Error, SealFailedSnafu};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Fixed per-message overhead of a sealed envelope.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// AES-128-GCM codec shared by every flow of a process.
///
/// The session key is derived from the pre-shared key as the first 16 bytes
/// of the lowercase hex MD5 digest. Existing peers speak exactly this
/// derivation, so it stays, even though it is not a real KDF. Nonces are
/// drawn fresh from the OS RNG on every seal; a counter scheme would not be
/// wire compatible.
pub struct AesGcmCipher {
	aead: Aes128Gcm,
}

impl AesGcmCipher {
	/// Build a codec from a pre-shared key of any length.
	pub fn new(key: &[u8]) -> Self {
		let hash = hex::encode(Md5::digest(key));
		let session_key = Key::<Aes128Gcm>::from_slice(&hash.as_bytes()[..16]);
		Self {
			aead: Aes128Gcm::new(session_key),
		}
	}

	/// Seal `plaintext` into `nonce ‖ ciphertext ‖ tag`.
	pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
		let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
		let sealed = self
			.aead
			.encrypt(&nonce, plaintext)
			.map_err(|_| SealFailedSnafu.build())?;

		let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
		envelope.extend_from_slice(&nonce);
		envelope.extend_from_slice(&sealed);
		Ok(envelope)
	}

	/// Open an envelope produced by [`encode`](Self::encode).
	pub fn decode(&self, envelope: &[u8]) -> Result<Vec<u8>, Error> {
		ensure!(
			envelope.len() >= NONCE_LEN,
			CipherTooShortSnafu { len: envelope.len() }
		);
		self.aead
			.decrypt(Nonce::from_slice(&envelope[..NONCE_LEN]), &envelope[NONCE_LEN..])
			.map_err(|_| AuthFailedSnafu.build())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Error;

	#[test]
	fn roundtrip() {
		let cipher = AesGcmCipher::new(b"password");
		let plaintext = b"I am sinchie";

		let envelope = cipher.encode(plaintext).unwrap();
		assert_eq!(envelope.len(), plaintext.len() + OVERHEAD);
		assert_eq!(cipher.decode(&envelope).unwrap(), plaintext);
	}

	#[test]
	fn key_derivation_vector() {
		// md5("password") = 5f4dcc3b5aa765d61d8327deb882cf99
		let hash = hex::encode(Md5::digest(b"password"));
		assert_eq!(&hash.as_bytes()[..16], b"5f4dcc3b5aa765d6");
	}

	#[test]
	fn short_envelope_rejected() {
		let cipher = AesGcmCipher::new(b"password");
		assert!(matches!(
			cipher.decode(&[0u8; 11]),
			Err(Error::CipherTooShort { len: 11, .. })
		));
	}

	#[test]
	fn tampered_envelope_rejected() {
		let cipher = AesGcmCipher::new(b"password");
		let mut envelope = cipher.encode(b"payload").unwrap();
		// flip one bit in the ciphertext region
		let mid = envelope.len() / 2;
		envelope[mid] ^= 0x01;
		assert!(matches!(cipher.decode(&envelope), Err(Error::AuthFailed { .. })));
	}

	#[test]
	fn wrong_key_rejected() {
		let sealed = AesGcmCipher::new(b"password").encode(b"payload").unwrap();
		assert!(matches!(
			AesGcmCipher::new(b"other").decode(&sealed),
			Err(Error::AuthFailed { .. })
		));
	}
}
