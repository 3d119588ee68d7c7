//! Two managers in one process: a server with named receivers and a client
//! that routes by receiver name and by metadata.
//!
//! Run with:
//!   cargo run --example named-receivers --features peer

use std::thread;
use std::time::{Duration, Instant};

use msgprims::frame::{FieldMap, FieldValue, Header};
use msgprims::peer::{BoxError, Message, MessageContext, MessagingConfig, MessagingManager};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = MessagingManager::start(MessagingConfig::default(), Some("127.0.0.1:0".parse()?))?;
    let addr = server.local_addr().ok_or("server has no listen address")?;
    server.set_metadata("zone", "eu-west");

    server.register_consumer("orders", |_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let order: serde_json::Value = msg.body_object()?;
        let reply = serde_json::json!({ "accepted": order["id"] });
        msg.reply(Header::new(), Some(&reply.to_string()))?;
        Ok(())
    });
    server.register_consumer("audit", |ctx: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let body = msg.body_bytes()?;
        eprintln!("[{}] {}", ctx.receiver_name().unwrap_or("-"), String::from_utf8_lossy(&body));
        if msg.header().expecting_response() {
            msg.reply(Header::new(), None)?;
        }
        Ok(())
    });

    let client = MessagingManager::start(MessagingConfig::default(), None)?;
    let destination = client.add_destination(addr);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !destination.is_linked() {
        if Instant::now() >= deadline {
            return Err(format!("could not reach {addr}").into());
        }
        thread::sleep(Duration::from_millis(20));
    }

    let mut reply = client.send_to_named("orders", Header::new(), Some(&r#"{"id":42}"#))?;
    println!("orders replied: {}", String::from_utf8_lossy(&reply.body_bytes()?));

    let filter = FieldMap::from([("zone".to_string(), FieldValue::from("eu-west"))]);
    let header = Header::new().with_named_receiver("audit");
    client.send_matching(filter, header, Some(&"order 42 accepted"))?;

    client.shutdown();
    server.shutdown();
    Ok(())
}
