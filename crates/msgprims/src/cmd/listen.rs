use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use msgprims_frame::Header;
use msgprims_peer::{BoxError, Message, MessageContext};

use crate::cmd::{install_ctrlc_handler, resolve_addr, start_manager, Context, ListenArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_message, MessageOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ListenArgs, ctx: &Context) -> CliResult<i32> {
    let bind = resolve_addr(&args.addr)?;
    let manager = start_manager(ctx, Some(bind))?;
    if let Some(addr) = manager.local_addr() {
        tracing::info!(%addr, "listening");
    }

    let (tx, rx) = bounded::<(MessageOutput, Vec<u8>)>(256);
    let consumer = move |_: &MessageContext, mut msg: Message| -> Result<(), BoxError> {
        let body = msg.body_bytes()?.to_vec();
        let peer = msg.endpoint().map(|endpoint| endpoint.peer_addr());
        let out = MessageOutput::new(msg.header(), &body, peer);
        if msg.header().expecting_response() {
            msg.reply(Header::new(), None)?;
        }
        tx.send((out, body)).map_err(|_| "listener stopped")?;
        Ok(())
    };
    for receiver in &args.receivers {
        manager.register_consumer(receiver.clone(), consumer.clone());
    }
    manager.set_default_consumer(consumer);

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let (out, body) = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(received) => received,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        print_message(&out, &body, ctx.format);
        printed = printed.saturating_add(1);

        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    drop(rx);
    manager.shutdown();
    Ok(SUCCESS)
}
