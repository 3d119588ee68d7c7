use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use msgprims_frame::{
    FieldMap, FieldValue, FrameConfig, FrameReader, FrameWriter, Header, HeaderType,
    NAMED_MESSAGE_RECEIVER_KEY,
};
use msgprims_peer::handshake::handshake_client_primary;
use msgprims_peer::{HandshakeConfig, SERVER_LOAD_KEY};
use msgprims_transport::{address_id, NetStream, TcpTransport, TransportError};
use serde::Serialize;

use crate::cmd::{parse_duration, resolve_addr, Context, InfoArgs};
use crate::exit::{frame_error, messaging_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::OutputFormat;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Serialize)]
struct InfoOutput {
    schema_id: &'static str,
    address: String,
    destination_id: i64,
    client_id: i64,
    protocol_version: u8,
    handshake_ms: f64,
    named_receivers: Vec<String>,
    server_load: Option<i64>,
    metadata: BTreeMap<String, serde_json::Value>,
    connected: bool,
}

pub fn run(args: InfoArgs, ctx: &Context) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let addr = resolve_addr(&args.addr)?;
    let config = ctx.config.messaging_config();

    let stream = connect_with_timeout(addr, timeout)?;
    stream
        .set_nodelay(true)
        .map_err(|err| transport_error("socket setup failed", err))?;
    let frame_config = FrameConfig {
        max_object_size: config.handshake.max_handshake_payload,
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
        ..config.frame.clone()
    };
    let reader_stream = stream
        .try_clone()
        .map_err(|err| transport_error("socket setup failed", err))?;
    let writer_stream = stream
        .try_clone()
        .map_err(|err| transport_error("socket setup failed", err))?;
    let mut reader = FrameReader::with_config_net(reader_stream, frame_config.clone())
        .map_err(|err| frame_error("socket setup failed", err))?;
    let mut writer = FrameWriter::with_config_net(writer_stream, frame_config)
        .map_err(|err| frame_error("socket setup failed", err))?;

    let handshake = HandshakeConfig {
        timeout,
        ..config.handshake.clone()
    };
    let local_metadata = ctx.config.field_metadata();
    let started = Instant::now();
    let outcome = handshake_client_primary(
        &mut reader,
        &mut writer,
        address_id(addr),
        (!local_metadata.is_empty()).then_some(local_metadata),
        &handshake,
    )
    .map_err(|err| messaging_error("handshake failed", err))?;
    let elapsed = started.elapsed();

    let goodbye = Header::of_type(HeaderType::Disconnect);
    if let Err(err) = writer.send(&goodbye, &[], outcome.negotiated_version) {
        tracing::debug!(%err, "disconnect notice not sent");
    }
    let _ = stream.shutdown();

    let metadata = outcome.remote_metadata.unwrap_or_default();
    let out = InfoOutput {
        schema_id: "https://schemas.3leaps.dev/msgprims/cli/v1/connection-info.schema.json",
        address: addr.to_string(),
        destination_id: address_id(addr),
        client_id: outcome.client_id,
        protocol_version: outcome.negotiated_version,
        handshake_ms: (elapsed.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        named_receivers: metadata
            .get(NAMED_MESSAGE_RECEIVER_KEY)
            .and_then(FieldValue::as_string_list)
            .unwrap_or_default(),
        server_load: metadata.get(SERVER_LOAD_KEY).and_then(FieldValue::as_i64),
        metadata: metadata_json(&metadata),
        connected: true,
    };

    print_info(&out, ctx.format);
    Ok(SUCCESS)
}

fn connect_with_timeout(addr: SocketAddr, timeout: Duration) -> CliResult<NetStream> {
    let start = Instant::now();
    loop {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("connect timed out after {timeout:?}"),
            ));
        }
        match TcpTransport::connect_timeout(addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(err) if is_retryable_connect_error(&err) => {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(err) => return Err(transport_error("connect failed", err)),
        }
    }
}

fn is_retryable_connect_error(err: &TransportError) -> bool {
    match err {
        TransportError::Connect { source, .. } => matches!(
            source.kind(),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}

fn metadata_json(metadata: &FieldMap) -> BTreeMap<String, serde_json::Value> {
    metadata
        .iter()
        .map(|(key, value)| {
            let json = match value {
                FieldValue::Null => serde_json::Value::Null,
                FieldValue::Text(text) => serde_json::Value::String(text.clone()),
                FieldValue::Object(object) => object.clone(),
            };
            (key.clone(), json)
        })
        .collect()
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Connection Info:");
            println!("  Address:          {}", out.address);
            println!("  Protocol:         msgprims v{}", out.protocol_version);
            println!("  Destination ID:   {}", out.destination_id);
            println!("  Client ID:        {}", out.client_id);
            println!("  Handshake:        {:.2}ms", out.handshake_ms);
            if out.named_receivers.is_empty() {
                println!("  Receivers:        none");
            } else {
                println!("  Receivers:        {}", out.named_receivers.join(", "));
            }
            match out.server_load {
                Some(load) => println!("  Server load:      {load}"),
                None => println!("  Server load:      unreported"),
            }
            for (key, value) in &out.metadata {
                if key != NAMED_MESSAGE_RECEIVER_KEY && key != SERVER_LOAD_KEY {
                    println!("  {key}: {value}");
                }
            }
        }
        OutputFormat::Raw => {
            println!("{}", out.client_id);
        }
    }
}
