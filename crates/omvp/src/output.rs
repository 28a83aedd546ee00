use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use omvp_session::{Frame, ProfileEntry, Statistics};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

#[derive(Serialize)]
struct StdoutOutput<'a> {
    stdout: &'a str,
}

/// Script text goes out verbatim except in JSON mode.
pub fn print_stdout(text: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StdoutOutput { stdout: text }),
        OutputFormat::Table | OutputFormat::Pretty => {
            let mut out = std::io::stdout();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}

#[derive(Serialize)]
struct FrameOutput {
    index: u64,
    width: u32,
    height: u32,
    depth: u32,
    format: u32,
    size: usize,
}

pub fn print_frame(index: u64, frame: &Frame, format: OutputFormat) {
    let out = FrameOutput {
        index,
        width: frame.width,
        height: frame.height,
        depth: frame.depth,
        format: frame.format,
        size: frame.data.len(),
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table | OutputFormat::Pretty => println!(
            "frame #{} {}x{} depth={} format={} size={}",
            out.index, out.width, out.height, out.depth, out.format, out.size
        ),
    }
}

#[derive(Serialize)]
struct StatsOutput<'a> {
    host: &'a Statistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<&'a Statistics>,
}

pub fn print_stats(host: &Statistics, device: Option<&Statistics>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&StatsOutput { host, device }),
        OutputFormat::Table => {
            let mut counters = table();
            let mut header = vec!["COUNTER", "HOST"];
            if device.is_some() {
                header.push("DEVICE");
            }
            counters.set_header(header);
            let device_rows = device.map(Statistics::rows);
            for (i, (name, value)) in host.rows().into_iter().enumerate() {
                let mut row = vec![name.to_string(), value.to_string()];
                if let Some(rows) = &device_rows {
                    row.push(rows[i].1.to_string());
                }
                counters.add_row(row);
            }
            println!("{counters}");

            let channels = merged_channels(host, device);
            if !channels.is_empty() {
                let mut bytes = table();
                bytes.set_header(vec!["CHANNEL", "HOST BYTES", "DEVICE BYTES"]);
                for (name, host_bytes, device_bytes) in channels {
                    bytes.add_row(vec![
                        name,
                        host_bytes.map_or("-".to_string(), |b| b.to_string()),
                        device_bytes.map_or("-".to_string(), |b| b.to_string()),
                    ]);
                }
                println!("{bytes}");
            }
        }
        OutputFormat::Pretty => {
            for (name, value) in host.rows() {
                match device {
                    Some(device) => {
                        let remote = device
                            .rows()
                            .into_iter()
                            .find(|(n, _)| *n == name)
                            .map_or(0, |(_, v)| v);
                        println!("{name:<18} host={value} device={remote}");
                    }
                    None => println!("{name:<18} {value}"),
                }
            }
            for (name, host_bytes, device_bytes) in merged_channels(host, device) {
                println!(
                    "channel {name}: host={} device={}",
                    host_bytes.unwrap_or(0),
                    device_bytes.unwrap_or(0)
                );
            }
        }
    }
}

type ChannelRow = (String, Option<u64>, Option<u64>);

fn merged_channels(host: &Statistics, device: Option<&Statistics>) -> Vec<ChannelRow> {
    let mut names: Vec<&String> = host.bytes_per_channel.keys().collect();
    if let Some(device) = device {
        names.extend(device.bytes_per_channel.keys());
    }
    names.sort();
    names.dedup();
    names
        .into_iter()
        .map(|name| {
            (
                name.clone(),
                host.bytes_per_channel.get(name).copied(),
                device.and_then(|d| d.bytes_per_channel.get(name).copied()),
            )
        })
        .collect()
}

#[derive(Serialize)]
struct ProfileOutput<'a> {
    entries: &'a [ProfileEntry],
}

pub fn print_profile(entries: &[ProfileEntry], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ProfileOutput { entries }),
        OutputFormat::Table => {
            let slots = entries.first().map_or(0, |e| e.events.len());
            let mut header: Vec<String> = [
                "ADDRESS", "CALLER", "CALLS", "MIN", "MAX", "MEAN", "TICKS", "CYCLES",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect();
            header.extend((0..slots).map(|slot| format!("EVENT{slot}")));

            let mut out = table();
            out.set_header(header);
            for entry in entries {
                let mut row = vec![
                    format!("0x{:08x}", entry.address),
                    format!("0x{:08x}", entry.caller),
                    entry.call_count.to_string(),
                    entry.min_ticks.to_string(),
                    entry.max_ticks.to_string(),
                    entry.mean_ticks().to_string(),
                    entry.total_ticks.to_string(),
                    entry.total_cycles.to_string(),
                ];
                row.extend(entry.events.iter().map(u64::to_string));
                out.add_row(row);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for entry in entries {
                println!(
                    "0x{:08x} <- 0x{:08x} calls={} ticks={} (min {} / mean {} / max {}) cycles={} events={:?}",
                    entry.address,
                    entry.caller,
                    entry.call_count,
                    entry.total_ticks,
                    entry.min_ticks,
                    entry.mean_ticks(),
                    entry.max_ticks,
                    entry.total_cycles,
                    entry.events
                );
            }
        }
    }
}

/// Two-column table for simple records.
pub fn print_fields(title: &str, fields: &[(&str, String)], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            print_json(&map);
        }
        OutputFormat::Table => {
            let mut out = table();
            out.set_header(vec!["FIELD", "VALUE"]);
            for (key, value) in fields {
                out.add_row(vec![key.to_string(), value.clone()]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!("{title}:");
            for (key, value) in fields {
                println!("  {:<16} {value}", format!("{key}:"));
            }
        }
    }
}
