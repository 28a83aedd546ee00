use omvp_session::{Capabilities, ConnectionState};
use serde::Serialize;

use crate::cmd::InfoArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_fields, print_json, OutputFormat};

#[derive(Serialize)]
struct InfoOutput {
    port: String,
    transport: &'static str,
    firmware: String,
    channels: Vec<String>,
    capabilities: Capabilities,
    state: ConnectionState,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let session = args.connect.open()?;
    let caps = session.capabilities();
    let out = InfoOutput {
        port: session.config().port.clone(),
        transport: session.transport_name(),
        firmware: session.firmware_version().to_string(),
        channels: session.channels(),
        capabilities: caps,
        state: session.state(),
    };
    session.close();

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table | OutputFormat::Pretty => {
            let features = [
                ("crc", caps.crc),
                ("seq", caps.seq),
                ("ack", caps.ack),
                ("events", caps.events),
            ]
            .iter()
            .filter(|(_, on)| *on)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ");
            print_fields(
                "Device Info",
                &[
                    ("port", out.port.clone()),
                    ("transport", out.transport.to_string()),
                    ("firmware", out.firmware.clone()),
                    ("channels", out.channels.join(", ")),
                    ("max payload", caps.max_payload.to_string()),
                    ("features", features),
                ],
                format,
            );
        }
    }
    Ok(SUCCESS)
}
