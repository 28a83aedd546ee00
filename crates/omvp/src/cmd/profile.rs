use omvp_session::ProfileMode;
use tracing::debug;

use crate::cmd::ProfileArgs;
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_profile, OutputFormat};

pub fn run(args: ProfileArgs, format: OutputFormat) -> CliResult<i32> {
    let mut session = args.connect.open()?;

    for &(slot, event) in &args.events {
        session
            .profiler_event_type(slot, event)
            .map_err(|err| session_error("event assignment failed", err))?;
        debug!(slot, event, "profiler slot assigned");
    }
    if args.exclusive || args.inclusive {
        session
            .profiler_mode(ProfileMode::from_exclusive(args.exclusive))
            .map_err(|err| session_error("profiler mode failed", err))?;
    }
    if args.reset {
        session
            .profiler_reset()
            .map_err(|err| session_error("profiler reset failed", err))?;
    }

    let mut entries = session
        .read_profile()
        .map_err(|err| session_error("profile read failed", err))?;
    entries.sort_by(|a, b| b.total_ticks.cmp(&a.total_ticks));
    if let Some(top) = args.top {
        entries.truncate(top);
    }

    print_profile(&entries, format);
    Ok(SUCCESS)
}
