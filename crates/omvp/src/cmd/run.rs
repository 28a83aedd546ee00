use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use omvp_session::{Resolution, Session, SessionError};
use omvp_transport::SerialStream;
use tracing::{info, warn};

use crate::cmd::{parse_duration, RunArgs};
use crate::exit::{
    io_error, session_error, CliError, CliResult, DATA_INVALID, INTERNAL, INTERRUPTED, SUCCESS,
};
use crate::output::{print_frame, print_stats, print_stdout, OutputFormat};

const ECHO_CHANNEL: &str = "buffer";
const ECHO_PATTERN: &[u8] = b"omvp-echo\n";
const ECHO_POLLS: usize = 50;

/// Why the follow loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    ScriptEnded,
    DurationElapsed,
    Interrupted,
}

pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let script = std::fs::read_to_string(&args.script)
        .map_err(|err| io_error(&format!("read {}", args.script.display()), err))?;
    let poll = parse_duration(&args.poll_interval)?;
    let limit = args.duration.as_deref().map(parse_duration).transpose()?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut session = args.connect.open()?;
    if args.echo_check {
        echo_check(&mut session, poll)?;
    }
    if args.stream {
        session
            .streaming(true, args.raw, Resolution::new(args.width, args.height))
            .map_err(|err| session_error("stream enable failed", err))?;
    }

    session
        .exec(&script)
        .map_err(|err| session_error("exec failed", err))?;
    info!(script = %args.script.display(), "script started");

    let finish = follow(&mut session, &args, format, poll, limit, &running)?;
    info!(?finish, "follow loop ended");

    drain_stdout(&mut session, format)?;
    if args.stream {
        session
            .streaming(false, false, Resolution::NATIVE)
            .map_err(|err| session_error("stream disable failed", err))?;
    }
    if !args.keep_running && finish != Finish::ScriptEnded {
        session
            .stop()
            .map_err(|err| session_error("stop failed", err))?;
    }

    print_stats(&session.host_stats(), None, format);
    session.close();

    Ok(match finish {
        Finish::Interrupted => INTERRUPTED,
        Finish::ScriptEnded | Finish::DurationElapsed => SUCCESS,
    })
}

fn follow(
    session: &mut Session<SerialStream>,
    args: &RunArgs,
    format: OutputFormat,
    poll: Duration,
    limit: Option<Duration>,
    running: &AtomicBool,
) -> CliResult<Finish> {
    let started = Instant::now();
    let mut frames = 0u64;
    loop {
        if !running.load(Ordering::SeqCst) {
            return Ok(Finish::Interrupted);
        }

        drain_stdout(session, format)?;

        if args.stream {
            match session.read_frame() {
                Ok(Some(frame)) => {
                    print_frame(frames, &frame, format);
                    frames += 1;
                }
                Ok(None) => {}
                Err(SessionError::MalformedFrame(reason)) => {
                    warn!(%reason, "dropping malformed frame");
                }
                Err(err) => return Err(session_error("frame read failed", err)),
            }
        }

        let status = session
            .read_status()
            .map_err(|err| session_error("status read failed", err))?;
        if status.is_some_and(|s| !s.script_running) {
            return Ok(Finish::ScriptEnded);
        }

        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            return Ok(Finish::DurationElapsed);
        }
        thread::sleep(poll);
    }
}

fn drain_stdout(session: &mut Session<SerialStream>, format: OutputFormat) -> CliResult<()> {
    if let Some(text) = session
        .read_stdout()
        .map_err(|err| session_error("stdout read failed", err))?
    {
        print_stdout(&text, format);
    }
    Ok(())
}

/// Write a pattern to the loopback channel and expect it back unchanged.
fn echo_check(session: &mut Session<SerialStream>, poll: Duration) -> CliResult<()> {
    let available = session
        .has_channel(ECHO_CHANNEL)
        .map_err(|err| session_error("channel lookup failed", err))?;
    if !available {
        warn!(channel = ECHO_CHANNEL, "device has no loopback channel; skipping echo check");
        return Ok(());
    }

    session
        .channel_write(ECHO_CHANNEL, ECHO_PATTERN)
        .map_err(|err| session_error("echo write failed", err))?;

    let mut echoed = Vec::with_capacity(ECHO_PATTERN.len());
    for _ in 0..ECHO_POLLS {
        if let Some(chunk) = session
            .channel_read(ECHO_CHANNEL)
            .map_err(|err| session_error("echo read failed", err))?
        {
            echoed.extend_from_slice(&chunk);
        }
        if echoed.len() >= ECHO_PATTERN.len() {
            break;
        }
        thread::sleep(poll);
    }

    if echoed != ECHO_PATTERN {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "echo check failed: sent {} bytes, got {} back",
                ECHO_PATTERN.len(),
                echoed.len()
            ),
        ));
    }
    info!(channel = ECHO_CHANNEL, bytes = echoed.len(), "echo check passed");
    Ok(())
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
