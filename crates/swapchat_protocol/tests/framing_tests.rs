use proptest::prelude::*;
use swapchat_protocol::pb::{self, envelope::Msg, event_envelope::Event};
use swapchat_protocol::{DEFAULT_MAX_FRAME_SIZE, FrameBuffer, FramingError, decode_frame, encode_frame, envelope};

fn chat_message(seq: u64, content: &str) -> pb::ChatMessage {
	pb::ChatMessage {
		id: format!("m{seq}"),
		conversation_id: "c1".to_string(),
		sender: "alice".to_string(),
		content: content.to_string(),
		seq,
		created_at_unix_ms: 1_700_000_000_000 + seq as i64,
	}
}

fn event(seq: u64, content: &str) -> pb::EventEnvelope {
	pb::EventEnvelope {
		conversation_id: "c1".to_string(),
		server_time_unix_ms: 1,
		event: Some(Event::MessageReceived(chat_message(seq, content))),
	}
}

#[test]
fn handshake_envelope_decodes_from_slice() {
	let env = envelope(
		"req-1",
		Msg::Handshake(pb::Handshake {
			token: "v1.abc.def".to_string(),
			client_name: "cli".to_string(),
		}),
	);

	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	let (decoded, used) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	assert_eq!(used, frame.len());
	assert_eq!(decoded.request_id, "req-1");
	match decoded.msg {
		Some(Msg::Handshake(h)) => assert_eq!(h.token, "v1.abc.def"),
		other => panic!("expected Handshake, got {other:?}"),
	}
}

#[test]
fn back_to_back_events_keep_their_order() {
	let mut wire = Vec::new();
	for seq in 1..=3 {
		wire.extend(encode_frame(&event(seq, "x"), DEFAULT_MAX_FRAME_SIZE).expect("encode"));
	}

	let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
	fb.extend(&wire);

	let mut seqs = Vec::new();
	while let Some(ev) = fb.next_frame::<pb::EventEnvelope>().expect("decode") {
		match ev.event {
			Some(Event::MessageReceived(m)) => seqs.push(m.seq),
			other => panic!("expected MessageReceived, got {other:?}"),
		}
	}

	assert_eq!(seqs, vec![1, 2, 3]);
	assert_eq!(fb.pending(), 0);
}

#[test]
fn oversized_message_is_refused_on_encode() {
	let err = encode_frame(&event(1, &"a".repeat(4096)), 128).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
			assert_eq!(max, 128);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn garbage_payload_is_a_decode_error() {
	let mut wire = 3u32.to_be_bytes().to_vec();
	wire.extend_from_slice(&[0xff, 0xff, 0xff]);

	let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
	fb.extend(&wire);
	assert!(matches!(
		fb.next_frame::<pb::Envelope>(),
		Err(FramingError::Decode(_))
	));
}

proptest! {
	#[test]
	fn arbitrary_chunking_yields_the_same_frames(
		contents in proptest::collection::vec(".{0,64}", 1..8),
		chunk in 1usize..32,
	) {
		let mut wire = Vec::new();
		for (i, c) in contents.iter().enumerate() {
			wire.extend(encode_frame(&event(i as u64 + 1, c), DEFAULT_MAX_FRAME_SIZE).expect("encode"));
		}

		let mut fb = FrameBuffer::new(DEFAULT_MAX_FRAME_SIZE);
		let mut got = Vec::new();
		for piece in wire.chunks(chunk) {
			fb.extend(piece);
			while let Some(ev) = fb.next_frame::<pb::EventEnvelope>().expect("decode") {
				if let Some(Event::MessageReceived(m)) = ev.event {
					got.push(m.content);
				}
			}
		}

		prop_assert_eq!(got, contents);
		prop_assert_eq!(fb.pending(), 0);
	}
}
