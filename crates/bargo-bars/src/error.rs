use std::backtrace::Backtrace;

use snafu::prelude::*;

use crate::frame::FrameType;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("ciphertext too short ({len} bytes)"))]
	CipherTooShort {
		len:       usize,
		backtrace: Backtrace,
	},
	#[snafu(display("aead authentication failed"))]
	AuthFailed {
		backtrace: Backtrace,
	},
	#[snafu(display("aead seal failed"))]
	SealFailed {
		backtrace: Backtrace,
	},
	#[snafu(display("frame length {length} exceeds the protocol limit"))]
	PackTooLong {
		length:    usize,
		backtrace: Backtrace,
	},
	// Peer went away between frames
	StreamClosed,
	#[snafu(display("sealed frame truncated ({len} bytes of inner data)"))]
	Malformed {
		len:       usize,
		backtrace: Backtrace,
	},
	#[snafu(display("unknown frame type {value:#04x}"))]
	UnknownFrameType {
		value:     u8,
		backtrace: Backtrace,
	},
	#[snafu(display("expected frame type {expect:?}, got {current:?}"))]
	TypeMismatch {
		expect:    FrameType,
		current:   FrameType,
		backtrace: Backtrace,
	},
	#[snafu(display("idle deadline elapsed"))]
	IdleTimeout,
	Io {
		source:    std::io::Error,
		backtrace: Backtrace,
	},
}
