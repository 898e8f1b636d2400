#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Length prefix size (big-endian `u32`).
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024; // 256 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData {
		need: usize,
		have: usize,
	},

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

fn check_len(len: usize, max: usize) -> Result<(), FramingError> {
	if len > max {
		return Err(FramingError::FrameTooLarge { len, max });
	}
	Ok(())
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	check_len(payload_len, max_frame_size)?;

	let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload_len);
	out.put_u32(payload_len as u32);
	msg.encode(&mut out)?;
	Ok(out)
}

/// Decode a single frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = peek_len(src) else {
		return Err(FramingError::InsufficientData {
			need: FRAME_HEADER_LEN,
			have: src.len(),
		});
	};
	check_len(len, max_frame_size)?;

	let need = FRAME_HEADER_LEN + len;
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[FRAME_HEADER_LEN..need])?;
	Ok((msg, need))
}

fn peek_len(src: &[u8]) -> Option<usize> {
	let header: [u8; FRAME_HEADER_LEN] = src.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
	Some(u32::from_be_bytes(header) as usize)
}

/// Accumulates bytes read from a stream and yields complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameBuffer {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	pub fn extend(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	/// Buffered bytes not yet consumed by a decoded frame.
	pub fn pending(&self) -> usize {
		self.buf.len()
	}

	/// Decode the next complete frame, or `None` if more bytes are needed.
	///
	/// An oversized length prefix is reported as soon as the header is visible so a
	/// hostile peer cannot make us buffer an unbounded payload.
	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		let Some(len) = peek_len(&self.buf) else {
			return Ok(None);
		};
		check_len(len, self.max_frame_size)?;

		if self.buf.len() < FRAME_HEADER_LEN + len {
			return Ok(None);
		}

		self.buf.advance(FRAME_HEADER_LEN);
		let payload = self.buf.split_to(len);
		Ok(Some(M::decode(payload)?))
	}
}
