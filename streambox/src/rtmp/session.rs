use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use h264_reader::nal::UnitType;
use log::{debug, info, trace, warn};
use once_cell::sync::OnceCell;
use rand::RngCore;

use crate::codec::{nal, CodecError};
use crate::queue::FrameQueue;
use crate::rtmp::amf::Amf0Value;
use crate::rtmp::chunk::{ChunkReader, ChunkWriter, RtmpMessage};
use crate::rtmp::{
    RtmpError, RtmpWire, CSID_AUDIO, CSID_COMMAND, CSID_PROTOCOL, CSID_VIDEO, DEFAULT_CHUNK_SIZE,
    MSG_ACKNOWLEDGEMENT, MSG_AUDIO, MSG_COMMAND_AMF0, MSG_SET_CHUNK_SIZE, MSG_SET_PEER_BANDWIDTH,
    MSG_USER_CONTROL, MSG_VIDEO, MSG_WINDOW_ACK_SIZE,
};
use crate::{AudioConfig, FrameKind, MediaFrame, VideoConfig};

/// Result codes the drain loop treats as fatal for the publish.
const REJECTION_CODES: [&str; 2] = ["NetStream.Publish.BadName", "NetConnection.Connect.Rejected"];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Publishing,
    Streaming,
    Stopped,
    Error,
}

/// Connection parameters the controller resolves before spawning the
/// publisher thread.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub app: String,
    pub play_path: String,
    pub tc_url: String,
    pub flash_version: String,
    pub chunk_size: usize,
    pub handshake_timeout: Duration,
}

/// Drives one publish session over an established TCP connection:
/// handshake, `connect`/`publish` command exchange, then the frame loop.
pub struct RtmpSession {
    wire: RtmpWire,
    writer: ChunkWriter,
    reader: ChunkReader,
    options: SessionOptions,
    state: SessionState,
    next_transaction: f64,

    audio_config: Arc<OnceCell<AudioConfig>>,
    audio_tag: u8,
    audio_started: bool,

    sps: Option<Bytes>,
    pps: Option<Bytes>,
    video_started: bool,

    window_ack_size: Option<u32>,
    bytes_received: u64,
    last_acknowledged: u64,
}

impl RtmpSession {
    pub fn new(
        wire: RtmpWire,
        options: SessionOptions,
        audio_config: Arc<OnceCell<AudioConfig>>,
    ) -> Self {
        RtmpSession {
            wire,
            // Outgoing messages use the raised chunk size only after the Set
            // Chunk Size control message announces it.
            writer: ChunkWriter::new(DEFAULT_CHUNK_SIZE),
            reader: ChunkReader::new(DEFAULT_CHUNK_SIZE),
            options,
            state: SessionState::Idle,
            next_transaction: 1.0,
            audio_config,
            audio_tag: 0,
            audio_started: false,
            sps: None,
            pps: None,
            video_started: false,
            window_ack_size: None,
            bytes_received: 0,
            last_acknowledged: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session until the queue ends, a stop is requested or a
    /// protocol error occurs. The socket is flushed and shut down on every
    /// exit path.
    pub fn run(&mut self, queue: &FrameQueue, stop: &AtomicBool) -> Result<(), RtmpError> {
        let result = self.run_inner(queue, stop);

        self.state = match &result {
            Ok(()) => SessionState::Stopped,
            Err(RtmpError::Interrupted) => SessionState::Stopped,
            Err(_) => SessionState::Error,
        };
        self.wire.shutdown();

        result
    }

    fn run_inner(&mut self, queue: &FrameQueue, stop: &AtomicBool) -> Result<(), RtmpError> {
        let started = Instant::now();

        self.state = SessionState::Handshaking;
        self.handshake(stop)?;
        debug!("handshake done in {:?}", started.elapsed());

        self.send_set_chunk_size()?;
        self.state = SessionState::Connected;
        self.send_connect()?;
        self.state = SessionState::Publishing;
        self.send_publish()?;
        self.poll_server()?;

        self.state = SessionState::Streaming;
        info!(
            "publishing to {}/{} after {:?}",
            self.options.app,
            self.options.play_path,
            started.elapsed()
        );

        while !stop.load(Ordering::Relaxed) {
            let frame = match queue.take() {
                Some(frame) => frame,
                None => break,
            };

            self.poll_server()?;

            match frame.kind {
                FrameKind::Audio => self.send_audio_frame(&frame)?,
                FrameKind::Video => self.send_video_nal(&frame)?,
                FrameKind::EndOfStream => {
                    debug!("end of stream");
                    break;
                }
            }
        }

        self.wire.flush()?;
        Ok(())
    }

    /// RTMP simple handshake: C0+C1 in one write, S0+S1 then S2 back, S1
    /// echoed as C2. The 1528-byte C1 tail is random past the time and zero
    /// fields.
    fn handshake(&mut self, stop: &AtomicBool) -> Result<(), RtmpError> {
        // Discard anything stale before the exchange starts.
        self.wire.drain()?;

        let mut c0c1 = [0u8; 1537];
        c0c1[0] = 3;
        rand::thread_rng().fill_bytes(&mut c0c1[9..]);
        self.wire.write(&c0c1)?;

        let deadline = Instant::now() + self.options.handshake_timeout;

        let mut s0s1 = [0u8; 1537];
        self.wire.read_exact_deadline(&mut s0s1, deadline, stop)?;
        if s0s1[0] != 3 {
            return Err(RtmpError::HandshakeRejected(s0s1[0]));
        }

        self.wire.write(&s0s1[1..])?;

        let mut s2 = [0u8; 1536];
        self.wire.read_exact_deadline(&mut s2, deadline, stop)?;

        Ok(())
    }

    fn send_set_chunk_size(&mut self) -> Result<(), RtmpError> {
        let payload = (self.options.chunk_size as u32).to_be_bytes();
        self.send_message(CSID_PROTOCOL, MSG_SET_CHUNK_SIZE, 0, 0, &payload)?;
        self.writer.set_chunk_size(self.options.chunk_size);
        debug!("output chunk size set to {}", self.options.chunk_size);
        Ok(())
    }

    fn send_connect(&mut self) -> Result<(), RtmpError> {
        let mut payload = BytesMut::new();
        Amf0Value::String("connect".to_string()).write(&mut payload);
        Amf0Value::Number(self.transaction_id()).write(&mut payload);
        Amf0Value::Object(vec![
            (
                "app".to_string(),
                Amf0Value::String(self.options.app.clone()),
            ),
            (
                "flashVer".to_string(),
                Amf0Value::String(self.options.flash_version.clone()),
            ),
            (
                "tcUrl".to_string(),
                Amf0Value::String(self.options.tc_url.clone()),
            ),
            ("fpad".to_string(), Amf0Value::Boolean(false)),
            ("capabilities".to_string(), Amf0Value::Number(15.0)),
            ("audioCodecs".to_string(), Amf0Value::Number(4071.0)),
            ("videoCodecs".to_string(), Amf0Value::Number(252.0)),
        ])
        .write(&mut payload);

        self.send_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, &payload)
    }

    fn send_publish(&mut self) -> Result<(), RtmpError> {
        let mut payload = BytesMut::new();
        Amf0Value::String("publish".to_string()).write(&mut payload);
        Amf0Value::Number(self.transaction_id()).write(&mut payload);
        Amf0Value::Null.write(&mut payload);
        Amf0Value::String(self.options.play_path.clone()).write(&mut payload);
        Amf0Value::String("live".to_string()).write(&mut payload);

        self.send_message(CSID_COMMAND, MSG_COMMAND_AMF0, 0, 0, &payload)
    }

    fn transaction_id(&mut self) -> f64 {
        let id = self.next_transaction;
        self.next_transaction += 1.0;
        id
    }

    fn send_audio_frame(&mut self, frame: &MediaFrame) -> Result<(), RtmpError> {
        if !self.audio_started {
            let Some(config) = self.audio_config.get().copied() else {
                warn!("audio frame before any configuration, dropping");
                return Ok(());
            };
            self.start_audio(&config, frame.pts)?;
        }

        let payload = audio_frame_payload(self.audio_tag, &frame.payload);
        self.send_message(CSID_AUDIO, MSG_AUDIO, 0, frame.pts as u32, &payload)
    }

    /// Sends the AAC sequence header; must precede every other audio message.
    fn start_audio(&mut self, config: &AudioConfig, ts: i64) -> Result<(), RtmpError> {
        info!("starting audio: {config}");
        self.audio_tag = audio_tag_byte(config);

        let payload = audio_header_payload(config);
        self.send_message(CSID_AUDIO, MSG_AUDIO, 0, ts as u32, &payload)?;
        self.audio_started = true;
        Ok(())
    }

    /// Routes one NALU: parameter sets update the session configuration,
    /// slice data is packaged as an AVC video message. Slices arriving before
    /// both parameter sets are known are dropped.
    fn send_video_nal(&mut self, frame: &MediaFrame) -> Result<(), RtmpError> {
        let unit_type = nal::unit_type(&frame.payload);

        match unit_type {
            Some(UnitType::SeqParameterSet) => {
                debug!("SPS arrived ({} bytes)", frame.payload.len());
                self.sps = Some(frame.payload.clone());
                return Ok(());
            }
            Some(UnitType::PicParameterSet) => {
                debug!("PPS arrived ({} bytes)", frame.payload.len());
                self.pps = Some(frame.payload.clone());
                return Ok(());
            }
            _ => {}
        }

        if !self.video_started && !self.start_video(frame.dts)? {
            warn!("dropping video frame: {}", CodecError::MissingSpsPps);
            return Ok(());
        }

        let key = unit_type == Some(UnitType::SliceLayerWithoutPartitioningIdr);
        let composition = (frame.pts - frame.dts).max(0) as u32;
        let payload = video_frame_payload(key, composition, &frame.payload);
        self.send_message(CSID_VIDEO, MSG_VIDEO, 0, frame.dts as u32, &payload)
    }

    /// Sends the AVC sequence header if both parameter sets are known.
    /// Returns whether video is started.
    fn start_video(&mut self, ts: i64) -> Result<bool, RtmpError> {
        let (sps, pps) = match (&self.sps, &self.pps) {
            (Some(sps), Some(pps)) => (sps.clone(), pps.clone()),
            _ => return Ok(false),
        };

        let config = VideoConfig { sps, pps };
        let record = match nal::decoder_configuration_record(&config) {
            Ok(record) => record,
            Err(e) => {
                warn!("cannot build decoder configuration: {e}");
                return Ok(false);
            }
        };

        info!(
            "starting video: SPS {} bytes, PPS {} bytes",
            config.sps.len(),
            config.pps.len()
        );

        let payload = video_header_payload(&record);
        self.send_message(CSID_VIDEO, MSG_VIDEO, 0, ts as u32, &payload)?;
        self.video_started = true;
        Ok(true)
    }

    fn send_message(
        &mut self,
        csid: u8,
        type_id: u8,
        msid: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<(), RtmpError> {
        let mut out = BytesMut::with_capacity(payload.len() + 16);
        self.writer
            .write_message(&mut out, csid, type_id, msid, timestamp, payload);
        self.wire.write(&out)
    }

    /// Drains and processes whatever the server has sent, so its reply
    /// window never stalls the connection.
    fn poll_server(&mut self) -> Result<(), RtmpError> {
        let drained = self.wire.drain()?;
        if drained.is_empty() {
            return Ok(());
        }

        self.bytes_received += drained.len() as u64;
        self.reader.extend(drained);

        while let Some(message) = self.reader.next_message()? {
            self.handle_message(message)?;
        }

        self.maybe_acknowledge()
    }

    fn handle_message(&mut self, message: RtmpMessage) -> Result<(), RtmpError> {
        match message.type_id {
            MSG_SET_CHUNK_SIZE if message.payload.len() >= 4 => {
                let size = u32::from_be_bytes(message.payload[..4].try_into().unwrap()) & 0x7FFF_FFFF;
                debug!("server chunk size is now {size}");
                self.reader.set_chunk_size(size as usize);
            }
            MSG_WINDOW_ACK_SIZE if message.payload.len() >= 4 => {
                let window = u32::from_be_bytes(message.payload[..4].try_into().unwrap());
                debug!("server window acknowledgement size {window}");
                self.window_ack_size = Some(window);
            }
            MSG_SET_PEER_BANDWIDTH => {
                trace!("set peer bandwidth");
            }
            MSG_ACKNOWLEDGEMENT | MSG_USER_CONTROL => {
                trace!("control message type {}", message.type_id);
            }
            MSG_COMMAND_AMF0 => self.handle_command(&message.payload)?,
            other => {
                trace!("ignoring message type {other} ({} bytes)", message.payload.len());
            }
        }

        Ok(())
    }

    fn handle_command(&mut self, payload: &[u8]) -> Result<(), RtmpError> {
        let values = match Amf0Value::read_all(payload) {
            Ok(values) => values,
            Err(e) => {
                warn!("unparseable command from server: {e}");
                return Ok(());
            }
        };

        let name = values.first().and_then(|v| v.as_str()).unwrap_or_default();
        let code = values
            .iter()
            .find_map(|v| v.field("code"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        trace!("server command {name:?} code {code:?}");

        if REJECTION_CODES.iter().any(|rejection| code == *rejection)
            || (name == "_error" && !code.is_empty())
        {
            let description = values
                .iter()
                .find_map(|v| v.field("description"))
                .and_then(|v| v.as_str())
                .unwrap_or(code);
            return Err(RtmpError::PublishRejected(description.to_string()));
        }

        Ok(())
    }

    /// Acknowledges received bytes once the server's advertised window is
    /// crossed.
    fn maybe_acknowledge(&mut self) -> Result<(), RtmpError> {
        let Some(window) = self.window_ack_size else {
            return Ok(());
        };

        if self.bytes_received - self.last_acknowledged >= window as u64 {
            let payload = (self.bytes_received as u32).to_be_bytes();
            self.send_message(CSID_PROTOCOL, MSG_ACKNOWLEDGEMENT, 0, 0, &payload)?;
            self.last_acknowledged = self.bytes_received;
        }

        Ok(())
    }
}

/// FLV AudioTagHeader byte for AAC: sound format 10, the fixed 44 kHz rate
/// code the FLV spec mandates for AAC, sample size and channel bits.
fn audio_tag_byte(config: &AudioConfig) -> u8 {
    0xA0 | (3 << 2)
        | (((config.sample_size.wrapping_sub(1)) & 1) << 1)
        | ((config.channels.wrapping_sub(1)) & 1)
}

fn audio_header_payload(config: &AudioConfig) -> Bytes {
    let specific = config.specific_config();
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u8(audio_tag_byte(config));
    payload.put_u8(0); // AACPacketType: sequence header
    payload.put_slice(&specific);
    payload.freeze()
}

fn audio_frame_payload(tag: u8, data: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + data.len());
    payload.put_u8(tag);
    payload.put_u8(1); // AACPacketType: raw access unit
    payload.put_slice(data);
    payload.freeze()
}

fn video_header_payload(record: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(5 + record.len());
    payload.put_u8(0x17); // keyframe | AVC
    payload.put_u8(0); // AVCPacketType: sequence header
    payload.put_slice(&[0, 0, 0]); // composition time
    payload.put_slice(record);
    payload.freeze()
}

fn video_frame_payload(key: bool, composition: u32, nal_unit: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(9 + nal_unit.len());
    payload.put_u8(if key { 0x17 } else { 0x27 });
    payload.put_u8(1); // AVCPacketType: NALU
    payload.put_u8((composition >> 16) as u8);
    payload.put_u8((composition >> 8) as u8);
    payload.put_u8(composition as u8);
    payload.put_slice(&nal::length_prefixed(nal_unit));
    payload.freeze()
}
