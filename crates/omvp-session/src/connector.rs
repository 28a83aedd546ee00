use omvp_transport::SerialStream;
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::Session;

/// Open the configured port and handshake with the device behind it.
pub fn connect(config: &SessionConfig) -> Result<Session<SerialStream>> {
    config.validate()?;
    let stream = SerialStream::open(&config.port, config.baudrate)?;
    debug!(port = %config.port, baudrate = config.baudrate, "port opened");
    Session::open(stream, config.clone())
}
