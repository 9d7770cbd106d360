use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};
use once_cell::sync::OnceCell;
use url::Url;

use crate::muxer::MediaMuxer;
use crate::queue::FrameQueue;
use crate::rtmp::session::SessionOptions;
use crate::rtmp::{RtmpError, RtmpSession, RtmpWire, DEFAULT_PORT};
use crate::{AudioConfig, MediaFrame, StreamConfig, StreamCounters};

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("Invalid server URL {0:?}, expected rtmp://host[:port]/app/playPath")]
    BadUrl(String),
}

/// A parsed `rtmp://host[:port]/app/playPath` ingest address.
///
/// `http://` and `https://` inputs are accepted and treated as rtmp; a
/// schemeless input gets `rtmp://` prepended.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub play_path: String,
}

impl ServerUrl {
    pub fn parse(input: &str) -> Result<ServerUrl, UrlError> {
        let has_scheme = ["rtmp://", "http://", "https://"]
            .iter()
            .any(|scheme| input.starts_with(scheme));
        let normalized = if has_scheme {
            input.to_string()
        } else {
            format!("rtmp://{input}")
        };

        let bad = || UrlError::BadUrl(input.to_string());

        let url = Url::parse(&normalized).map_err(|_| bad())?;
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(bad)?.to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let path = url.path().trim_start_matches('/');
        let mut segments = path.split('/');
        let (app, play_path) = match (segments.next(), segments.next(), segments.next()) {
            (Some(app), Some(play), None) if !app.is_empty() && !play.is_empty() => (app, play),
            _ => return Err(bad()),
        };

        Ok(ServerUrl {
            host,
            port,
            app: app.to_string(),
            play_path: play_path.to_string(),
        })
    }

    /// The `tcUrl` the connect command advertises.
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}/{}",
            self.host, self.port, self.app, self.play_path
        )
    }
}

/// Notifications from the publisher thread.
#[derive(Debug)]
pub enum PublisherEvent {
    /// The session failed; the stream has already been torn down.
    Error(RtmpError),
    /// The session ended after a stop request or end of stream.
    Finished,
}

struct Publisher {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    queue: Arc<FrameQueue>,
}

/// The user-facing façade: owns the muxer and the publisher thread, routes
/// capture callbacks, and exposes the session counters.
pub struct StreamController {
    config: StreamConfig,
    server: Option<ServerUrl>,
    muxer: MediaMuxer,
    audio_config: Arc<OnceCell<AudioConfig>>,
    counters: Arc<StreamCounters>,
    streaming: Arc<AtomicBool>,
    publisher: Option<Publisher>,
    events_tx: Sender<PublisherEvent>,
    events_rx: Receiver<PublisherEvent>,
}

impl StreamController {
    pub fn new(config: StreamConfig) -> Self {
        let audio_config = Arc::new(OnceCell::new());
        let (events_tx, events_rx) = unbounded();

        StreamController {
            config,
            server: None,
            muxer: MediaMuxer::new(audio_config.clone()),
            audio_config,
            counters: Arc::new(StreamCounters::default()),
            streaming: Arc::new(AtomicBool::new(false)),
            publisher: None,
            events_tx,
            events_rx,
        }
    }

    pub fn set_server(&mut self, url: &str) -> Result<(), UrlError> {
        let server = ServerUrl::parse(url)?;
        info!("server set to {server}");
        self.server = Some(server);
        Ok(())
    }

    pub fn server(&self) -> Option<&ServerUrl> {
        self.server.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    /// Resets the per-session state and spawns the publisher thread. A call
    /// while already streaming is a no-op.
    pub fn start_streaming(&mut self) -> anyhow::Result<()> {
        if self.is_streaming() {
            return Ok(());
        }

        // Reap a publisher that already ended on its own (error path) before
        // starting a new session.
        if let Some(publisher) = self.publisher.take() {
            publisher.stop.store(true, Ordering::Relaxed);
            publisher.queue.stop();
            let _ = publisher.handle.join();
        }

        let server = self
            .server
            .clone()
            .context("no server URL has been configured")?;

        self.counters.reset();
        self.audio_config = Arc::new(OnceCell::new());
        self.muxer = MediaMuxer::new(self.audio_config.clone());

        let queue = Arc::new(FrameQueue::new(
            self.config.audio_queue_cap,
            self.config.video_queue_cap,
            self.counters.clone(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        self.streaming.store(true, Ordering::Relaxed);

        let options = SessionOptions {
            app: server.app.clone(),
            play_path: server.play_path.clone(),
            tc_url: server.tc_url(),
            flash_version: self.config.flash_version.clone(),
            chunk_size: self.config.chunk_size,
            handshake_timeout: self.config.handshake_timeout,
        };

        let handle = thread::Builder::new().name("rtmp-publisher".to_string()).spawn({
            let queue = queue.clone();
            let stop = stop.clone();
            let streaming = self.streaming.clone();
            let counters = self.counters.clone();
            let audio_config = self.audio_config.clone();
            let events = self.events_tx.clone();
            let connect_timeout = self.config.connect_timeout;
            let poll_interval = self.config.read_poll_interval;

            move || {
                let result = RtmpWire::connect(
                    &server.host,
                    server.port,
                    connect_timeout,
                    poll_interval,
                    counters,
                )
                .and_then(|wire| {
                    let mut session = RtmpSession::new(wire, options, audio_config);
                    session.run(&queue, &stop)
                });

                streaming.store(false, Ordering::Relaxed);
                queue.stop();

                let event = match result {
                    Ok(()) | Err(RtmpError::Interrupted) => PublisherEvent::Finished,
                    Err(e) => {
                        error!("publish failed: {e}");
                        PublisherEvent::Error(e)
                    }
                };
                let _ = events.send(event);
            }
        })?;

        self.publisher = Some(Publisher {
            handle,
            stop,
            queue,
        });

        Ok(())
    }

    /// Requests the publisher to stop, waits for it to flush and close the
    /// socket, and logs the session summary.
    pub fn stop_streaming(&mut self) {
        let Some(publisher) = self.publisher.take() else {
            return;
        };

        info!(
            "stopping: {} frames received ({} audio, {} video), {} dropped, {} KiB written",
            self.counters.total_frames(),
            self.counters.audio_frames(),
            self.counters.video_frames(),
            self.counters.dropped_frames(),
            self.counters.bytes_written() / 1024,
        );

        publisher.queue.post(MediaFrame::end_of_stream());
        publisher.stop.store(true, Ordering::Relaxed);
        publisher.queue.stop();

        if publisher.handle.join().is_err() {
            warn!("publisher thread panicked");
        }

        self.streaming.store(false, Ordering::Relaxed);
    }

    /// Capture callback for one compressed audio frame. Dropped when not
    /// streaming; malformed frames are logged and skipped.
    pub fn handle_audio_frame(&mut self, buffer: &[u8], ts_us: u64, _is_key: bool) {
        if !self.is_streaming() {
            return;
        }

        match self.muxer.handle_audio(buffer, ts_us) {
            Ok(frame) => self.post(frame),
            Err(e) => warn!("dropping audio frame: {e}"),
        }
    }

    /// Capture callback for one compressed video frame.
    pub fn handle_video_frame(&mut self, buffer: &[u8], ts_us: u64, is_key: bool) {
        if !self.is_streaming() {
            return;
        }

        match self.muxer.handle_video(buffer, ts_us, is_key) {
            Ok(frames) => {
                for frame in frames {
                    self.post(frame);
                }
            }
            Err(e) => warn!("dropping video frame: {e}"),
        }
    }

    /// Boundary adaptor for capture SDKs that deliver raw pointers. The
    /// buffer is only borrowed for the duration of the call; the muxer copies
    /// it into an owned frame before anything is posted.
    ///
    /// # Safety
    ///
    /// `buffer` must point to at least `size` readable bytes for the duration
    /// of the call.
    pub unsafe fn handle_audio_frame_raw(
        &mut self,
        buffer: *const u8,
        size: u64,
        ts_us: u64,
        is_key: bool,
    ) {
        if buffer.is_null() {
            return;
        }
        let data = std::slice::from_raw_parts(buffer, size as usize);
        self.handle_audio_frame(data, ts_us, is_key);
    }

    /// # Safety
    ///
    /// `buffer` must point to at least `size` readable bytes for the duration
    /// of the call.
    pub unsafe fn handle_video_frame_raw(
        &mut self,
        buffer: *const u8,
        size: u64,
        ts_us: u64,
        is_key: bool,
    ) {
        if buffer.is_null() {
            return;
        }
        let data = std::slice::from_raw_parts(buffer, size as usize);
        self.handle_video_frame(data, ts_us, is_key);
    }

    fn post(&self, frame: MediaFrame) {
        if let Some(publisher) = &self.publisher {
            publisher.queue.post(frame);
        }
    }

    /// Next pending publisher notification, if any.
    pub fn poll_event(&self) -> Option<PublisherEvent> {
        self.events_rx.try_recv().ok()
    }

    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    pub fn audio_frames_count(&self) -> u64 {
        self.counters.audio_frames()
    }

    pub fn video_frames_count(&self) -> u64 {
        self.counters.video_frames()
    }

    pub fn total_frames_count(&self) -> u64 {
        self.counters.total_frames()
    }

    pub fn dropped_frames_count(&self) -> u64 {
        self.counters.dropped_frames()
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.counters.bytes_written()
    }

    /// Audio metadata for display, available once the first audio frame has
    /// been parsed.
    pub fn audio_config(&self) -> Option<AudioConfig> {
        self.audio_config.get().copied()
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use test_case::test_case;

    #[test]
    fn parses_full_url() {
        let url = ServerUrl::parse("rtmp://a.example.com:1935/live/key1").unwrap();

        assert_eq!("a.example.com", url.host);
        assert_eq!(1935, url.port);
        assert_eq!("live", url.app);
        assert_eq!("key1", url.play_path);
        assert_eq!("rtmp://a.example.com:1935/live", url.tc_url());
        assert_eq!("a.example.com:1935/live/key1", url.to_string());
    }

    #[test]
    fn prepends_scheme_and_defaults_port() {
        let url = ServerUrl::parse("a.example.com/live/key1").unwrap();

        assert_eq!("a.example.com", url.host);
        assert_eq!(1935, url.port);
    }

    #[test]
    fn accepts_http_schemes() {
        let url = ServerUrl::parse("https://a.example.com/live2/stream-key").unwrap();

        assert_eq!(1935, url.port);
        assert_eq!("live2", url.app);
    }

    #[test_case("rtmp://a.example.com/live" ; "missing play path")]
    #[test_case("rtmp://a.example.com/live/a/b" ; "path too deep")]
    #[test_case("rtmp://a.example.com//key" ; "empty app")]
    #[test_case("rtmp://a.example.com/live/" ; "empty play path")]
    #[test_case("rtmp://" ; "no host")]
    #[test_case("not a url at all" ; "garbage")]
    fn rejects_bad_urls(input: &str) {
        assert_matches!(ServerUrl::parse(input), Err(UrlError::BadUrl(_)));
    }

    #[test]
    fn callbacks_are_noops_when_idle() {
        let mut controller = StreamController::new(StreamConfig::default());

        controller.handle_audio_frame(&[0xFF, 0xF1], 0, false);
        controller.handle_video_frame(&[0, 0, 0, 1], 0, true);

        assert_eq!(0, controller.total_frames_count());
        assert!(!controller.is_streaming());
    }

    #[test]
    fn start_without_server_fails() {
        let mut controller = StreamController::new(StreamConfig::default());
        assert!(controller.start_streaming().is_err());
    }
}
