use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use msgprims_frame::Header;
use msgprims_peer::{BoxError, Message, MessageContext};

use crate::cmd::{install_ctrlc_handler, resolve_addr, start_manager, Context, EchoArgs};
use crate::exit::{CliResult, SUCCESS};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: EchoArgs, ctx: &Context) -> CliResult<i32> {
    let bind = resolve_addr(&args.addr)?;
    let manager = start_manager(ctx, Some(bind))?;
    if let Some(addr) = manager.local_addr() {
        tracing::info!(%addr, "echo server listening");
    }

    for receiver in &args.receivers {
        manager.register_consumer(receiver.clone(), echo);
    }
    manager.set_default_consumer(echo);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }

    manager.shutdown();
    Ok(SUCCESS)
}

fn echo(ctx: &MessageContext, mut msg: Message) -> Result<(), BoxError> {
    let body = msg.body_bytes()?;
    tracing::info!(
        message_id = msg.header().message_id,
        message_type = msg.header().message_type,
        receiver = ctx.receiver_name().unwrap_or("-"),
        size = body.len(),
        "echoing message"
    );
    if msg.header().expecting_response() {
        msg.reply(reply_header(msg.header()), Some(&body))?;
    }
    Ok(())
}

fn reply_header(inbound: &Header) -> Header {
    Header::new().with_message_type(inbound.message_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_keeps_message_type_only() {
        let inbound = Header::new()
            .with_message_type(12)
            .with_named_receiver("orders")
            .with_description("request");
        let reply = reply_header(&inbound);
        assert_eq!(reply.message_type, 12);
        assert!(reply.named_receiver().is_none());
        assert!(reply.description.is_empty());
    }
}
