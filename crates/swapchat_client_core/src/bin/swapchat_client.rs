#![forbid(unsafe_code)]

use swapchat_client_core::{ClientConfig, DEFAULT_SERVER_ENDPOINT_QUIC, SessionControl};
use swapchat_protocol::pb::event_envelope::Event;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: swapchat_client [--connect quic://host:port] [--token token] [--peer principal]... [--say text]\n\
\n\
Options:\n\
	--connect   Server endpoint (default: {DEFAULT_SERVER_ENDPOINT_QUIC})\n\
	--token     Session token (default: $SWAPCHAT_TOKEN)\n\
	--peer      Other participant of the conversation to open (repeatable)\n\
	--say       Send one message to the opened conversation, then keep listening\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Tokens are minted with `swapchat_server --issue-token <principal>`.\n\
	Without --peer the client only lists its conversations and prints pushed events.\n\
\n\
Examples:\n\
	swapchat_client --token $ALICE --peer bob\n\
	swapchat_client --connect quic://127.0.0.1:18204 --token $BOB --peer alice --say hi\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,swapchat_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	token: String,
	peers: Vec<String>,
	say: Option<String>,
}

fn non_empty(flag: &str, v: Option<String>) -> String {
	let v = v.unwrap_or_else(|| usage_and_exit());
	if v.trim().is_empty() {
		eprintln!("{flag} must be non-empty");
		usage_and_exit();
	}
	v
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_QUIC.to_string();
	let mut token = std::env::var("SWAPCHAT_TOKEN").ok().map(|v| v.trim().to_string());
	let mut peers = Vec::new();
	let mut say = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = non_empty("--connect", it.next()),
			"--token" => token = Some(non_empty("--token", it.next())),
			"--peer" => peers.push(non_empty("--peer", it.next())),
			"--say" => say = Some(non_empty("--say", it.next())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(token) = token.filter(|t| !t.is_empty()) else {
		eprintln!("a session token is required (--token or SWAPCHAT_TOKEN)");
		usage_and_exit();
	};

	if say.is_some() && peers.is_empty() {
		eprintln!("--say needs at least one --peer");
		usage_and_exit();
	}

	Args {
		endpoint,
		token,
		peers,
		say,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let mut cfg = ClientConfig::from_quic_endpoint(&args.endpoint, args.token)?;
	cfg.client_name = format!("swapchat-client-cli/{}", env!("CARGO_PKG_VERSION"));

	let (mut control, ok) = SessionControl::connect(cfg).await?;
	info!(principal = %ok.principal, server_instance_id = %ok.server_instance_id, "signed in");

	let mut events = control.events()?;

	if args.peers.is_empty() {
		for c in control.list_conversations().await? {
			println!("conversation {} with {}", c.id, c.participants.join(", "));
		}
	} else {
		let conv = control.open_conversation(args.peers).await?;
		println!("conversation {} with {}", conv.id, conv.participants.join(", "));

		let history = control.fetch_history(&conv.id).await?;
		for m in history.messages {
			println!("[{}] #{} {}: {}", m.conversation_id, m.seq, m.sender, m.content);
		}

		if let Some(text) = args.say {
			let sent = control.send_message(&conv.id, text).await?;
			info!(message_id = %sent.id, seq = sent.seq, "sent");
		}
	}

	let res = events
		.run_events_loop(|ev| match ev.event {
			Some(Event::MessageReceived(m)) => {
				println!("[{}] #{} {}: {}", m.conversation_id, m.seq, m.sender, m.content);
			}
			Some(Event::Typing(t)) => {
				let state = if t.active { "is typing" } else { "stopped typing" };
				println!("[{}] {} {state}", ev.conversation_id, t.sender);
			}
			None => warn!(conversation_id = %ev.conversation_id, "event without payload"),
		})
		.await;

	control.close(0, "bye");

	if let Err(e) = res {
		warn!(error = %e, "events loop ended with error");
	}

	Ok(())
}
