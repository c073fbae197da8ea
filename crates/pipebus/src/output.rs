use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use pipebus_bus::{flag, FrameHeader};
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

#[derive(Serialize)]
struct PacketOutput<'a> {
    msg_id: u64,
    kind: u8,
    flags: &'a str,
    payload_size: usize,
    payload: String,
}

pub fn print_packet(info: &FrameHeader, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = PacketOutput {
                msg_id: info.msg_id,
                kind: info.kind,
                flags: flags_name(info.flags),
                payload_size: payload.len(),
                payload: payload_preview(payload),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["MSG_ID", "KIND", "FLAGS", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    info.msg_id.to_string(),
                    info.kind.to_string(),
                    flags_name(info.flags).to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "msg_id={} kind={} flags={} size={} payload={}",
                info.msg_id,
                info.kind,
                flags_name(info.flags),
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
        }
    }
}

#[derive(Serialize)]
struct SentOutput {
    msg_id: u64,
    kind: u8,
    payload_size: usize,
}

pub fn print_sent(msg_id: u64, kind: u8, payload_size: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = SentOutput {
                msg_id,
                kind,
                payload_size,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Raw => {}
        _ => {
            println!("sent msg_id={msg_id} kind={kind} size={payload_size}");
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn flags_name(flags: u8) -> &'static str {
    if flags == 0 {
        "NONE"
    } else if flags & flag::PTR != 0 {
        "PTR"
    } else if flags & flag::OBJ_PTR != 0 {
        "CHUNKED"
    } else if flags & flag::CHUNK != 0 {
        "CHUNK"
    } else {
        "OTHER"
    }
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
