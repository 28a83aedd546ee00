use tracing::info;

use crate::cmd::StopArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_fields, OutputFormat};

pub fn run(args: StopArgs, format: OutputFormat) -> CliResult<i32> {
    let mut session = args.connect.open()?;
    session
        .stop()
        .map_err(|err| session_error("stop failed", err))?;
    info!(port = %session.config().port, "script stopped");
    print_fields(
        "Stop",
        &[
            ("port", session.config().port.clone()),
            ("stopped", "true".to_string()),
        ],
        format,
    );
    Ok(SUCCESS)
}
