//! The Bars tunnel protocol: length-prefixed, padded, AEAD-sealed frames
//! carried between the two proxy peers, plus the bidirectional relay that
//! pumps a plaintext connection through a framed tunnel.

mod error;
pub use error::*;

pub mod cipher;
pub mod frame;
pub mod pipe;
