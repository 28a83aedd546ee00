use crate::cmd::StatsArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_stats, OutputFormat};

pub fn run(args: StatsArgs, format: OutputFormat) -> CliResult<i32> {
    let mut session = args.connect.open()?;
    let device = if args.host_only {
        None
    } else {
        Some(
            session
                .device_stats()
                .map_err(|err| session_error("device stats failed", err))?,
        )
    };
    print_stats(&session.host_stats(), device.as_ref(), format);
    Ok(SUCCESS)
}
