//! Run a short script and print what it writes.
//!
//! ```text
//! cargo run -p omvp --example basic -- /dev/ttyACM0
//! ```

use std::time::{Duration, Instant};

use omvp::{connect, SessionConfig};

const SCRIPT: &str = "\
import time
for i in range(5):
    print('tick', i)
    time.sleep_ms(100)
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port = std::env::args()
        .nth(1)
        .unwrap_or_else(|| SessionConfig::default().port);
    let config = SessionConfig {
        port,
        ..SessionConfig::default()
    };

    let mut session = connect(&config)?;
    println!(
        "connected: firmware {} channels {:?}",
        session.firmware_version(),
        session.channels()
    );

    session.exec(SCRIPT)?;
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if let Some(text) = session.read_stdout()? {
            print!("{text}");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    session.stop()?;

    let stats = session.host_stats();
    println!(
        "sent {} received {} retries {}",
        stats.packets_sent, stats.packets_received, stats.retries
    );
    Ok(())
}
