#![forbid(unsafe_code)]

pub mod framing;
pub mod pb;

pub use framing::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_LEN, FrameBuffer, FramingError, decode_frame, encode_frame};

/// ALPN identifier for the v1 transport.
pub const ALPN: &[u8] = b"swapchat-v1";

/// Protocol version written into `pb::Envelope.version`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Build an envelope with the current protocol version.
pub fn envelope(request_id: impl Into<String>, msg: pb::envelope::Msg) -> pb::Envelope {
	pb::Envelope {
		version: PROTOCOL_VERSION,
		request_id: request_id.into(),
		msg: Some(msg),
	}
}

/// Build an error reply.
pub fn error_envelope(request_id: impl Into<String>, code: &str, message: impl Into<String>) -> pb::Envelope {
	envelope(
		request_id,
		pb::envelope::Msg::Error(pb::Error {
			code: code.to_string(),
			message: message.into(),
		}),
	)
}
