//! Count two hardware events per function and print the busiest ones.

use omvp::session::ProfileMode;
use omvp::{connect, SessionConfig};

/// ARMv7-M PMU event ids.
const INSTRUCTIONS_RETIRED: u32 = 0x08;
const DCACHE_MISS: u32 = 0x03;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SessionConfig::default().port);
    let mut session = connect(&SessionConfig {
        port,
        ..SessionConfig::default()
    })?;

    session.profiler_event_type(0, INSTRUCTIONS_RETIRED)?;
    session.profiler_event_type(1, DCACHE_MISS)?;
    session.profiler_mode(ProfileMode::Exclusive)?;
    session.profiler_reset()?;

    std::thread::sleep(std::time::Duration::from_secs(1));

    let mut entries = session.read_profile()?;
    entries.sort_by(|a, b| b.total_cycles.cmp(&a.total_cycles));
    for entry in entries.iter().take(10) {
        println!(
            "0x{:08x} calls={:<6} cycles={:<10} events={:?}",
            entry.address, entry.call_count, entry.total_cycles, entry.events
        );
    }
    Ok(())
}
