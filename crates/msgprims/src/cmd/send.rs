use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use msgprims_frame::Header;
use msgprims_peer::{Destination, DispatchRequest, Target};

use crate::cmd::{parse_duration, resolve_addr, start_manager, Context, SendArgs};
use crate::exit::{io_error, messaging_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, MessageOutput};

const LINK_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn run(args: SendArgs, ctx: &Context) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let addr = resolve_addr(&args.addr)?;
    let body = resolve_payload(&args)?;

    let manager = start_manager(ctx, None)?;
    let destination = manager.add_destination(addr);
    let started = Instant::now();
    wait_for_link(&destination, timeout)?;

    let remaining = timeout.saturating_sub(started.elapsed()).max(Duration::from_millis(1));
    let (header, target) = build_request(&args, destination.destination_id());
    let request = DispatchRequest {
        header: Some(header),
        body: Some(&body),
        target: Some(target),
        timeout: Some(remaining),
        asynch: args.asynch,
        proxied: false,
    };

    let reply = manager
        .dispatch(request)
        .map_err(|err| messaging_error("send failed", err))?;

    if let Some(mut reply) = reply {
        let bytes = reply
            .body_bytes()
            .map_err(|err| messaging_error("reading reply failed", err))?;
        let out = MessageOutput::new(reply.header(), &bytes, Some(addr));
        print_message(&out, &bytes, ctx.format);
    } else {
        tracing::info!(%addr, size = body.len(), "message sent");
    }

    manager.shutdown();
    Ok(SUCCESS)
}

fn build_request(args: &SendArgs, destination_id: i64) -> (Header, Target) {
    let mut header = Header::new();
    if let Some(message_type) = args.message_type {
        header.message_type = message_type;
    }
    match &args.receiver {
        Some(name) => {
            header.set_named_receiver(name.clone());
            (header, Target::NamedReceiver(name.clone()))
        }
        None => (header, Target::Destination(destination_id)),
    }
}

fn wait_for_link(destination: &Destination, timeout: Duration) -> CliResult<()> {
    let deadline = Instant::now() + timeout;
    while !destination.is_linked() {
        if Instant::now() >= deadline {
            return Err(if destination.is_error() {
                CliError::new(
                    FAILURE,
                    format!("unable to connect to {}", destination.description()),
                )
            } else {
                CliError::new(TIMEOUT, format!("connect timed out after {timeout:?}"))
            });
        }
        thread::sleep(LINK_POLL_INTERVAL);
    }
    Ok(())
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(json.as_bytes().to_vec());
    }
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err));
    }
    Ok(Vec::new())
}
