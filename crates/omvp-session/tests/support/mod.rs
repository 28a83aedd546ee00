//! A scripted stand-in for a device, served on one end of a socket pair.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use omvp_frame::{
    CodecConfig, Flags, Opcode, Packet, PacketKind, PacketReader, PacketWriter, HEADER_SIZE,
};
use omvp_session::control::{
    decode_tagged, encode_channel_list, encode_tagged, NAK_BAD_REQUEST, NAK_NO_CHANNEL,
    NAK_UNSUPPORTED,
};
use omvp_session::profile::{decode_read_request, encode_snapshot};
use omvp_session::{
    Capabilities, FirmwareVersion, ProfileEntry, Session, SessionConfig, Statistics, Status,
    StreamSettings, STDOUT_CHANNEL,
};

const WIRE_MAX: usize = u16::MAX as usize;
/// Stream frames are pushed in fragments of this many bytes.
pub const FRAME_FRAGMENT: usize = 16;

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub caps: Capabilities,
    pub version: FirmwareVersion,
    pub channels: Vec<String>,
    /// Function addresses reported by the profiler.
    pub functions: Vec<u32>,
    /// Corrupt the first reply to this opcode; the resend is clean.
    pub corrupt_reply_once: Option<Opcode>,
    /// Send the first reply to this opcode with a skipped sequence number.
    pub bad_sequence_once: Option<Opcode>,
    /// Lose sequence state after answering `ScriptStop`.
    pub reboot_on_stop: bool,
    /// Answer at most this many `Sync` requests.
    pub sync_replies: Option<usize>,
    /// Never answer anything.
    pub silent: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            caps: Capabilities {
                crc: true,
                seq: true,
                ack: true,
                events: true,
                max_payload: 4096,
            },
            version: FirmwareVersion {
                major: 4,
                minor: 7,
                patch: 0,
            },
            channels: vec![STDOUT_CHANNEL.to_string(), "buffer".to_string()],
            functions: vec![0x0800_1000, 0x0800_2000, 0x0800_3000],
            corrupt_reply_once: None,
            bad_sequence_once: None,
            reboot_on_stop: false,
            sync_replies: None,
            silent: false,
        }
    }
}

/// What the device saw, returned once the host hangs up.
#[derive(Debug, Default)]
pub struct DeviceLog {
    pub requests: Vec<Opcode>,
    pub syncs: usize,
    pub event_acks: usize,
    pub duplicates: usize,
    pub script_fragments: usize,
    pub scripts: Vec<String>,
    pub stops: usize,
    pub stream: Option<StreamSettings>,
    pub profile_mode: Option<u32>,
    pub profile_slots: BTreeMap<u32, u32>,
    pub profile_resets: usize,
}

pub struct SimDevice {
    handle: thread::JoinHandle<DeviceLog>,
}

impl SimDevice {
    /// Serve `stream` on a background thread.
    pub fn serve(stream: UnixStream, options: DeviceOptions) -> Self {
        let handle = thread::spawn(move || Device::new(options).run(stream));
        Self { handle }
    }

    /// Wait for the host to disconnect and collect the log.
    pub fn finish(self) -> DeviceLog {
        self.handle.join().unwrap()
    }
}

/// A host stream connected to a freshly spawned device.
pub fn spawn(options: DeviceOptions) -> (UnixStream, SimDevice) {
    let (host, device) = UnixStream::pair().unwrap();
    (host, SimDevice::serve(device, options))
}

/// Session settings suited to an in-process device.
pub fn fast_config() -> SessionConfig {
    SessionConfig {
        port: "sim".to_string(),
        timeout: Duration::from_millis(300),
        ..SessionConfig::default()
    }
}

/// Spawn a device and complete the handshake against it.
pub fn open(options: DeviceOptions, config: SessionConfig) -> (Session<UnixStream>, SimDevice) {
    let (host, device) = spawn(options);
    let session = Session::open(host, config).unwrap();
    (session, device)
}

/// Call `f` until it yields a value or `limit` elapses.
pub fn poll_until<T>(limit: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = std::time::Instant::now() + limit;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if std::time::Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

struct Device {
    options: DeviceOptions,
    log: DeviceLog,
    negotiated: Capabilities,
    tx_seq: u8,
    last_rx: Option<u8>,
    cached_reply: Option<Bytes>,
    pending_events: Vec<Packet>,
    script_buf: Vec<u8>,
    script_running: bool,
    script_channels: BTreeSet<String>,
    buffers: BTreeMap<String, Vec<u8>>,
    stats: Statistics,
}

impl Device {
    fn new(options: DeviceOptions) -> Self {
        Self {
            negotiated: options.caps,
            options,
            log: DeviceLog::default(),
            tx_seq: 0,
            last_rx: None,
            cached_reply: None,
            pending_events: Vec::new(),
            script_buf: Vec::new(),
            script_running: false,
            script_channels: BTreeSet::new(),
            buffers: BTreeMap::new(),
            stats: Statistics::default(),
        }
    }

    fn run(mut self, stream: UnixStream) -> DeviceLog {
        let config = CodecConfig {
            max_payload: WIRE_MAX,
            crc: true,
        };
        let mut reader = PacketReader::with_config(stream.try_clone().unwrap(), config);
        let mut writer = PacketWriter::with_max_payload(stream, WIRE_MAX);

        loop {
            let packet = match reader.read_packet() {
                Ok(packet) => packet,
                Err(err) if err.is_checksum() => continue,
                Err(_) => break,
            };
            self.stats.packets_received += 1;
            if self.options.silent {
                continue;
            }
            if self.handle(packet, &mut writer).is_err() {
                break;
            }
        }
        self.log
    }

    fn handle(
        &mut self,
        packet: Packet,
        writer: &mut PacketWriter<UnixStream>,
    ) -> omvp_frame::Result<()> {
        if packet.kind() == PacketKind::Ack {
            self.log.event_acks += 1;
            return Ok(());
        }
        if packet.opcode == Opcode::Sync {
            self.log.syncs += 1;
            if self
                .options
                .sync_replies
                .is_some_and(|limit| self.log.syncs > limit)
            {
                return Ok(());
            }
            self.reset_sequence();
            writer.write_packet(&Packet::new(Opcode::Sync, Flags::ACK, 0, Bytes::new()))?;
            return Ok(());
        }

        let wants_reply = packet.flags.contains(Flags::ACK_REQ);
        if self.last_rx == Some(packet.sequence) {
            self.log.duplicates += 1;
            if let Some(wire) = &self.cached_reply {
                writer.write_raw(wire)?;
            }
            return Ok(());
        }
        self.last_rx = Some(packet.sequence);
        self.cached_reply = None;
        self.log.requests.push(packet.opcode);

        let reply = self.respond(&packet);
        if !wants_reply {
            return Ok(());
        }

        for event in std::mem::take(&mut self.pending_events) {
            let mut flags = event.flags;
            if self.negotiated.ack {
                flags |= Flags::ACK_REQ;
            }
            let event = Packet::new(event.opcode, flags, self.next_seq(), event.payload);
            writer.write_packet(&event)?;
            self.stats.packets_sent += 1;
        }

        let (flags, payload) = match reply {
            Ok(payload) => (Flags::ACK, payload),
            Err(status) => (Flags::NAK, Bytes::copy_from_slice(&[status])),
        };
        let mut sequence = self.next_seq();
        if self.options.bad_sequence_once == Some(packet.opcode) {
            self.options.bad_sequence_once = None;
            sequence = sequence.wrapping_add(5);
        }
        let wire = writer.encode(&Packet::new(packet.opcode, flags, sequence, payload))?;
        if self.options.corrupt_reply_once == Some(packet.opcode) {
            self.options.corrupt_reply_once = None;
            let mut corrupt = wire.to_vec();
            let at = if corrupt.len() > HEADER_SIZE { HEADER_SIZE } else { 4 };
            corrupt[at] ^= 0x01;
            writer.write_raw(&corrupt)?;
        } else {
            writer.write_raw(&wire)?;
        }
        self.stats.packets_sent += 1;
        self.cached_reply = Some(wire);

        if packet.opcode == Opcode::ScriptStop && self.options.reboot_on_stop {
            self.reset_sequence();
        }
        Ok(())
    }

    fn reset_sequence(&mut self) {
        self.tx_seq = 0;
        self.last_rx = None;
        self.cached_reply = None;
    }

    fn next_seq(&mut self) -> u8 {
        let seq = self.tx_seq;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        seq
    }

    /// Reply payload, or a NAK status.
    fn respond(&mut self, packet: &Packet) -> Result<Bytes, u8> {
        match packet.opcode {
            Opcode::Caps => {
                let host = Capabilities::decode(&packet.payload).map_err(|_| NAK_BAD_REQUEST)?;
                self.negotiated = host.intersect(&self.options.caps);
                Ok(self.options.caps.encode())
            }
            Opcode::Version => Ok(self.options.version.encode()),
            Opcode::ChannelList => {
                encode_channel_list(&self.options.channels).map_err(|_| NAK_BAD_REQUEST)
            }
            Opcode::Stats => {
                let mut stats = self.stats.clone();
                stats.bytes_per_channel = self
                    .buffers
                    .iter()
                    .map(|(name, buf)| (name.clone(), buf.len() as u64))
                    .collect();
                stats.encode().map_err(|_| NAK_BAD_REQUEST)
            }
            Opcode::ScriptExec => {
                self.log.script_fragments += 1;
                self.script_buf.extend_from_slice(&packet.payload);
                if !packet.is_fragment() {
                    let script = String::from_utf8_lossy(&self.script_buf).into_owned();
                    self.script_buf.clear();
                    self.run_script(&script);
                    self.log.scripts.push(script);
                }
                Ok(Bytes::new())
            }
            Opcode::ScriptStop => {
                self.log.stops += 1;
                self.script_running = false;
                self.script_channels.clear();
                Ok(Bytes::new())
            }
            Opcode::Status => Ok(self.status().encode()),
            Opcode::ChannelRead => {
                let (name, _) = decode_tagged(&packet.payload).map_err(|_| NAK_BAD_REQUEST)?;
                if !self.knows(&name) {
                    return Err(NAK_NO_CHANNEL);
                }
                let room = usize::from(self.negotiated.max_payload) - 1 - name.len();
                let buf = self.buffers.entry(name.clone()).or_default();
                let data: Vec<u8> = buf.drain(..room.min(buf.len())).collect();
                encode_tagged(&name, &data).map_err(|_| NAK_BAD_REQUEST)
            }
            Opcode::ChannelWrite => {
                let (name, data) = decode_tagged(&packet.payload).map_err(|_| NAK_BAD_REQUEST)?;
                if !self.knows(&name) {
                    return Err(NAK_NO_CHANNEL);
                }
                // Every channel loops back to itself.
                self.buffers.entry(name).or_default().extend_from_slice(&data);
                Ok(Bytes::new())
            }
            Opcode::StreamControl => {
                let settings =
                    StreamSettings::decode(&packet.payload).map_err(|_| NAK_BAD_REQUEST)?;
                self.log.stream = Some(settings);
                Ok(Bytes::new())
            }
            Opcode::ProfileMode => {
                let mode = u32_arg(&packet.payload, 0)?;
                self.log.profile_mode = Some(mode);
                Ok(Bytes::new())
            }
            Opcode::ProfileEvent => {
                let slot = u32_arg(&packet.payload, 0)?;
                let event = u32_arg(&packet.payload, 4)?;
                self.log.profile_slots.insert(slot, event);
                Ok(Bytes::new())
            }
            Opcode::ProfileReset => {
                self.log.profile_resets += 1;
                Ok(Bytes::new())
            }
            Opcode::ProfileSize => {
                let size = self.snapshot()?.len() as u32;
                Ok(Bytes::copy_from_slice(&size.to_le_bytes()))
            }
            Opcode::ProfileRead => {
                let (offset, len) =
                    decode_read_request(&packet.payload).map_err(|_| NAK_BAD_REQUEST)?;
                let snapshot = self.snapshot()?;
                let start = (offset as usize).min(snapshot.len());
                let end = (start + len as usize).min(snapshot.len());
                Ok(snapshot.slice(start..end))
            }
            Opcode::Sync
            | Opcode::ChannelData
            | Opcode::ChannelRegister
            | Opcode::StreamFrame => Err(NAK_UNSUPPORTED),
        }
    }

    fn knows(&self, name: &str) -> bool {
        self.options.channels.iter().any(|c| c == name) || self.script_channels.contains(name)
    }

    fn status(&self) -> Status {
        Status {
            script_running: self.script_running,
            stdout_pending: self
                .buffers
                .get(STDOUT_CHANNEL)
                .is_some_and(|buf| !buf.is_empty()),
            frame_pending: false,
            profile_enabled: true,
            profile_has_pmu: !self.log.profile_slots.is_empty(),
        }
    }

    fn snapshot(&self) -> Result<Bytes, u8> {
        let slots = self
            .log
            .profile_slots
            .keys()
            .next_back()
            .map_or(0, |max| max + 1);
        let slots = u8::try_from(slots).map_err(|_| NAK_BAD_REQUEST)?;
        let entries: Vec<ProfileEntry> = self
            .options
            .functions
            .iter()
            .enumerate()
            .map(|(i, &address)| ProfileEntry {
                address,
                caller: 0x0800_0000,
                call_count: i as u32 + 1,
                min_ticks: 2,
                max_ticks: 8,
                total_ticks: 10 * (i as u64 + 1),
                total_cycles: 1_000 * (i as u64 + 1),
                events: (0..u64::from(slots)).map(|s| s + 1).collect(),
            })
            .collect();
        encode_snapshot(&entries, slots).map_err(|_| NAK_BAD_REQUEST)
    }

    fn push_event(&mut self, opcode: Opcode, flags: Flags, payload: Bytes) {
        if self.negotiated.events {
            self.pending_events
                .push(Packet::new(opcode, Flags::EVENT | flags, 0, payload));
        }
    }

    /// Interpret a toy script, one directive per line.
    fn run_script(&mut self, script: &str) {
        self.script_running = true;
        self.script_channels.clear();
        for line in script.lines() {
            if let Some(text) = line.strip_prefix("print:") {
                let out = self.buffers.entry(STDOUT_CHANNEL.to_string()).or_default();
                out.extend_from_slice(text.as_bytes());
                out.push(b'\n');
            } else if let Some(name) = line.strip_prefix("channel:") {
                self.script_channels.insert(name.to_string());
                if let Ok(payload) = encode_tagged(name, &[]) {
                    self.push_event(Opcode::ChannelRegister, Flags::NONE, payload);
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                let (name, text) = rest.split_once(':').unwrap_or((rest, ""));
                if let Ok(payload) = encode_tagged(name, text.as_bytes()) {
                    self.push_event(Opcode::ChannelData, Flags::NONE, payload);
                }
            } else if let Some(count) = line.strip_prefix("frames:") {
                let streaming = self.log.stream.is_some_and(|s| s.enable);
                let count: u8 = count.parse().unwrap_or(0);
                for i in 0..count {
                    if streaming {
                        self.push_frame(i);
                    }
                }
            } else if line == "malformed_frame" {
                self.push_event(Opcode::StreamFrame, Flags::NONE, Bytes::from(vec![0u8; 10]));
            }
        }
        let status = self.status().encode();
        self.push_event(Opcode::Status, Flags::NONE, status);
    }

    fn push_frame(&mut self, tag: u8) {
        let frame = omvp_session::Frame {
            width: 4,
            height: 2,
            depth: 1,
            format: 0,
            raw_size: 8,
            data: Bytes::from(vec![tag; 8]),
        };
        let wire = frame.encode();
        let chunks: Vec<Bytes> = wire
            .chunks(FRAME_FRAGMENT)
            .map(Bytes::copy_from_slice)
            .collect();
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let flags = if i < last { Flags::FRAGMENT } else { Flags::NONE };
            self.push_event(Opcode::StreamFrame, flags, chunk);
        }
    }
}

fn u32_arg(payload: &[u8], at: usize) -> Result<u32, u8> {
    payload
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(NAK_BAD_REQUEST)
}
