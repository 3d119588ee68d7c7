//! Minimal echo server: replies to every message with its own body.
//!
//! Run with:
//!   cargo run --example echo-server --features peer
//!
//! In another terminal:
//!   cargo run --features cli -- send 127.0.0.1:7400 --json '{"hello":"world"}'

use std::thread;
use std::time::Duration;

use msgprims::frame::Header;
use msgprims::peer::{BoxError, Message, MessageContext, MessagingConfig, MessagingManager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7400".to_string())
        .parse()?;

    let manager = MessagingManager::start(MessagingConfig::default(), Some(addr))?;
    eprintln!("Listening on {addr}");

    manager.set_default_consumer(|_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let body = msg.body_bytes()?;
        eprintln!(
            "Received {} bytes (message type {})",
            body.len(),
            msg.header().message_type
        );
        if msg.header().expecting_response() {
            msg.reply(Header::new(), Some(&body))?;
        }
        Ok(())
    });

    loop {
        thread::sleep(Duration::from_secs(60));
        eprintln!("{} pending replies", manager.pending_replies());
    }
}
