use bytes::Bytes;
use omvp_frame::Opcode;
use omvp_transport::{SerialStream, Transport};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::control::{
    decode_tagged, decode_u32, encode_tagged, Capabilities, FirmwareVersion, Status,
    STDOUT_CHANNEL,
};
use crate::error::{Result, SessionError};
use crate::handshake::{handshake, HandshakeResult};
use crate::link::{ConnectionState, Link, LinkEvent, Request};
use crate::mux::ChannelMux;
use crate::profile::{
    decode_snapshot, encode_event_type, encode_read_request, ProfileEntry, ProfileMode,
};
use crate::stats::Statistics;
use crate::stream::{Frame, FrameDecoder, Resolution, StreamSettings};

/// A connected device.
///
/// Owns the transport for its whole lifetime; dropping the session closes it.
/// Nothing is sent on drop: a running script keeps running.
pub struct Session<T: Transport = SerialStream> {
    link: Link<T>,
    config: SessionConfig,
    handshake: HandshakeResult,
    mux: ChannelMux,
    frames: FrameDecoder,
    latest_status: Option<Status>,
    streaming: Option<StreamSettings>,
}

impl<T: Transport> Session<T> {
    /// Handshake over an already-open transport.
    pub fn open(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let mut link = Link::new(transport, &config)?;
        let handshake = handshake(&mut link, &config)?;

        let mut mux = ChannelMux::new();
        mux.advertise(&[STDOUT_CHANNEL]);
        mux.advertise(&handshake.channels);

        let mut session = Self {
            link,
            config,
            handshake,
            mux,
            frames: FrameDecoder::new(),
            latest_status: None,
            streaming: None,
        };
        session.dispatch_events();
        Ok(session)
    }

    /// Send a request that expects a reply and return the reply payload.
    fn request(&mut self, request: Request) -> Result<Bytes> {
        let opcode = request.opcode;
        let reply = self.link.send_request(request, true);
        // Events may have arrived before the failure too.
        self.dispatch_events();
        reply?
            .map(|packet| packet.payload)
            .ok_or_else(|| SessionError::Disconnected(format!("no reply to {opcode}")))
    }

    /// Pump the link and interpret whatever the device pushed.
    fn pump(&mut self) -> Result<()> {
        let polled = self.link.poll_events();
        self.dispatch_events();
        polled
    }

    fn dispatch_events(&mut self) {
        for event in self.link.take_events() {
            match event {
                LinkEvent::Resynced => self.frames.reset_partial(),
                LinkEvent::Packet(packet) => match packet.opcode {
                    Opcode::Status => match Status::decode(&packet.payload) {
                        Ok(status) => self.latest_status = Some(status),
                        Err(err) => warn!(%err, "bad status event"),
                    },
                    Opcode::ChannelData => match decode_tagged(&packet.payload) {
                        Ok((name, data)) => {
                            trace!(channel = %name, len = data.len(), "channel data");
                            self.mux.deliver(&name, data);
                        }
                        Err(err) => warn!(%err, "bad channel data event"),
                    },
                    Opcode::ChannelRegister => match decode_tagged(&packet.payload) {
                        Ok((name, _)) => self.mux.register(&name),
                        Err(err) => warn!(%err, "bad channel register event"),
                    },
                    Opcode::StreamFrame => self.frames.push(&packet),
                    Opcode::ScriptStop => {
                        debug!("script ended on device");
                        self.mux.reset_script_channels();
                        self.frames.reset_partial();
                    }
                    Opcode::Sync
                    | Opcode::Caps
                    | Opcode::Stats
                    | Opcode::Version
                    | Opcode::ScriptExec
                    | Opcode::ChannelList
                    | Opcode::ChannelRead
                    | Opcode::ChannelWrite
                    | Opcode::StreamControl
                    | Opcode::ProfileMode
                    | Opcode::ProfileEvent
                    | Opcode::ProfileReset
                    | Opcode::ProfileSize
                    | Opcode::ProfileRead => {
                        debug!(opcode = ?packet.opcode, "ignoring unexpected event");
                    }
                },
            }
        }
    }

    fn max_payload(&self) -> usize {
        self.link.max_payload()
    }

    /// Run a script. Channels and frames left by the previous script are dropped.
    pub fn exec(&mut self, script: &str) -> Result<()> {
        self.mux.reset_script_channels();
        self.frames.reset_partial();
        self.latest_status = None;

        let bytes = script.as_bytes();
        let chunk = self.max_payload();
        let parts: Vec<&[u8]> = if bytes.is_empty() {
            vec![bytes]
        } else {
            bytes.chunks(chunk).collect()
        };
        let last = parts.len() - 1;
        info!(len = bytes.len(), fragments = parts.len(), "executing script");
        for (i, part) in parts.into_iter().enumerate() {
            let request =
                Request::new(Opcode::ScriptExec, Bytes::copy_from_slice(part)).with_more(i < last);
            self.request(request)?;
        }
        Ok(())
    }

    /// Stop the running script.
    pub fn stop(&mut self) -> Result<()> {
        self.request(Request::empty(Opcode::ScriptStop))?;
        self.mux.reset_script_channels();
        self.frames.reset_partial();
        info!("script stopped");
        Ok(())
    }

    /// Current device status.
    ///
    /// With events negotiated this returns the newest pushed status since the
    /// last call, or `None`. Otherwise the device is queried.
    pub fn read_status(&mut self) -> Result<Option<Status>> {
        if self.handshake.capabilities.events {
            self.pump()?;
            return Ok(self.latest_status.take());
        }
        let reply = self.request(Request::empty(Opcode::Status))?;
        Ok(Some(Status::decode(&reply)?))
    }

    /// Script text output produced since the last call.
    pub fn read_stdout(&mut self) -> Result<Option<String>> {
        Ok(self
            .channel_read(STDOUT_CHANNEL)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Send bytes on a named channel.
    pub fn channel_write(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if !self.mux.has(name) {
            return Err(SessionError::ChannelUnavailable(name.to_string()));
        }
        let max_payload = self.max_payload();
        self.mux.write(name, data, max_payload)?;
        let flushed = self.flush_outbound(name);
        if let Err(err) = &flushed {
            // The rest of a failed write must not lead the next one.
            let dropped = self.mux.clear_outbound(name);
            warn!(channel = name, dropped, %err, "channel write failed");
        }
        flushed
    }

    fn flush_outbound(&mut self, name: &str) -> Result<()> {
        let requires_ack = self.handshake.capabilities.ack;
        while let Some(payload) = self.mux.take_outbound(name)? {
            let request = Request::new(Opcode::ChannelWrite, payload);
            if requires_ack {
                self.request(request)?;
            } else {
                self.link.send_request(request, false)?;
            }
        }
        Ok(())
    }

    /// Read everything pending on a named channel.
    pub fn channel_read(&mut self, name: &str) -> Result<Option<Bytes>> {
        if !self.mux.has(name) {
            return Err(SessionError::ChannelUnavailable(name.to_string()));
        }
        self.pump()?;
        let reply = self.request(Request::new(Opcode::ChannelRead, encode_tagged(name, &[])?))?;
        if !reply.is_empty() {
            let (tag, data) = decode_tagged(&reply)?;
            if tag != name {
                return Err(SessionError::MalformedFrame(format!(
                    "channel read for '{name}' answered for '{tag}'"
                )));
            }
            self.mux.deliver(name, data);
        }
        Ok(self.mux.read(name))
    }

    /// Whether a channel is known, after taking in pending device events.
    pub fn has_channel(&mut self, name: &str) -> Result<bool> {
        self.pump()?;
        Ok(self.mux.has(name))
    }

    /// Start, stop or reconfigure the frame stream.
    pub fn streaming(&mut self, enable: bool, raw: bool, resolution: Resolution) -> Result<()> {
        let settings = StreamSettings {
            enable,
            raw,
            resolution,
        };
        self.request(Request::new(Opcode::StreamControl, settings.encode()))?;
        self.frames.set_raw(raw);
        if !enable {
            self.frames.reset_partial();
        }
        self.streaming = Some(settings);
        debug!(?settings, "stream control applied");
        Ok(())
    }

    /// The newest complete frame not yet returned.
    pub fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.pump()?;
        self.frames.take()
    }

    /// Assign a hardware event to a profiler counter slot.
    pub fn profiler_event_type(&mut self, slot: u32, event_id: u32) -> Result<()> {
        self.request(Request::new(
            Opcode::ProfileEvent,
            encode_event_type(slot, event_id),
        ))?;
        Ok(())
    }

    /// Clear all profiler counters.
    pub fn profiler_reset(&mut self) -> Result<()> {
        self.request(Request::empty(Opcode::ProfileReset))?;
        Ok(())
    }

    pub fn profiler_mode(&mut self, mode: ProfileMode) -> Result<()> {
        self.request(Request::new(Opcode::ProfileMode, mode.encode()))?;
        Ok(())
    }

    /// Fetch and decode a full profiler snapshot.
    pub fn read_profile(&mut self) -> Result<Vec<ProfileEntry>> {
        let reply = self.request(Request::empty(Opcode::ProfileSize))?;
        let total = decode_u32(&reply, "profile size")?;

        let page = u32::try_from(self.max_payload()).unwrap_or(u32::MAX);
        let mut snapshot = Vec::new();
        let mut offset = 0u32;
        while offset < total {
            let len = page.min(total - offset);
            let chunk = self.request(Request::new(
                Opcode::ProfileRead,
                encode_read_request(offset, len),
            ))?;
            if chunk.is_empty() || chunk.len() > len as usize {
                return Err(SessionError::MalformedFrame(format!(
                    "profile read at {offset} returned {} bytes, asked for {len}",
                    chunk.len()
                )));
            }
            snapshot.extend_from_slice(&chunk);
            offset += chunk.len() as u32;
        }
        trace!(total, "profile snapshot fetched");
        decode_snapshot(&snapshot)
    }

    /// Host-side link counters and per-channel byte totals.
    pub fn host_stats(&self) -> Statistics {
        let mut stats = self.link.stats().clone();
        stats.bytes_per_channel = self.mux.bytes_per_channel();
        stats
    }

    /// Device-side counters.
    pub fn device_stats(&mut self) -> Result<Statistics> {
        let reply = self.request(Request::empty(Opcode::Stats))?;
        Statistics::decode(&reply)
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.handshake.firmware
    }

    pub fn capabilities(&self) -> Capabilities {
        self.handshake.capabilities
    }

    /// Known channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.mux.names()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.link.transport_name()
    }

    /// Last stream settings sent, if any.
    pub fn stream_settings(&self) -> Option<StreamSettings> {
        self.streaming
    }

    /// Close the session and release the transport.
    pub fn close(self) {
        // Dropping the link closes both transport halves.
        debug!(stats = ?self.host_stats(), "closing session");
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        debug!(transport = self.link.transport_name(), "session released");
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("link", &self.link)
            .field("firmware", &self.handshake.firmware)
            .field("channels", &self.mux.names())
            .finish()
    }
}
