use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use msgprims_frame::{Header, UNDEFINED};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One message as printed by `listen` and `send`.
#[derive(Serialize)]
pub struct MessageOutput {
    schema_id: &'static str,
    header_type: String,
    message_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_to_id: Option<i64>,
    sender_id: i64,
    message_type: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver: Option<String>,
    asynch: bool,
    body_size: usize,
    body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer: Option<String>,
    timestamp: String,
}

impl MessageOutput {
    pub fn new(header: &Header, body: &[u8], peer: Option<SocketAddr>) -> Self {
        Self {
            schema_id: "https://schemas.3leaps.dev/msgprims/cli/v1/message.schema.json",
            header_type: format!("{:?}", header.header_type),
            message_id: header.message_id,
            response_to_id: (header.response_to_id != UNDEFINED).then_some(header.response_to_id),
            sender_id: header.sender_id,
            message_type: header.message_type,
            receiver: header.named_receiver().map(str::to_string),
            asynch: header.asynch,
            body_size: body.len(),
            body: body_preview(body),
            peer: peer.map(|addr| addr.to_string()),
            timestamp: now_unix_seconds(),
        }
    }
}

pub fn print_message(out: &MessageOutput, body: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TYPE", "ID", "MSG TYPE", "RECEIVER", "SIZE", "PEER", "BODY"])
                .add_row(vec![
                    out.header_type.clone(),
                    out.message_id.to_string(),
                    out.message_type.to_string(),
                    out.receiver.clone().unwrap_or_else(|| "-".to_string()),
                    out.body_size.to_string(),
                    out.peer.clone().unwrap_or_else(|| "-".to_string()),
                    out.body.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "type={} id={} message_type={} receiver={} size={} peer={} body={}",
                out.header_type,
                out.message_id,
                out.message_type,
                out.receiver.as_deref().unwrap_or("-"),
                out.body_size,
                out.peer.as_deref().unwrap_or("-"),
                out.body
            );
        }
        OutputFormat::Raw => {
            print_raw(body);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", body.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
