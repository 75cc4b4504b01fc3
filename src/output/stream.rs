//! Stream lifecycle and the two session workers.
//!
//! A session runs on three threads: the host's encoder thread produces
//! packets into the queue, the connect worker opens the feeder session,
//! and the sender worker drains the queue into the feeder. Workers only
//! set flags and post the queue signal; all joins happen in the lifecycle
//! owner (`stop` and `Drop`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::{build_transport_config, ConfigError, EncoderParams, StreamConfig};
use crate::feeder::{BitrateFeedback, SendOutcome, Transport, TransportSession, ZixiFeeder};
use crate::feeder_bindings::TIME_BETWEEN_AUTO_BOND_SCAN_US;
use crate::packet::{rebased_timestamps, wrap_adts, EncodedPacket, PacketKind};
use crate::queue::PacketQueue;
use crate::settings::Settings;
use crate::url::ZixiUrl;

use super::feedback::FeedbackController;

const STATS_QUERY_INTERVAL_NS: u64 = 1_000_000_000;
const TIME_TO_CLEAR_CONGESTION_NS: u64 = 5_000_000_000;

/// Monotonic nanoseconds since the first call in this process.
pub(crate) fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Why a session ended, delivered through [`StreamOutput::signal_stop`].
/// A stop requested by the host emits no signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The transport failed mid-session.
    Disconnected,
    /// The URL did not parse.
    BadPath,
    /// The feeder refused the session; carries the negated feeder code.
    ConnectError(i32),
}

/// Host-side collaborator: encoder access and lifecycle notifications.
///
/// Callbacks may arrive on worker threads.
pub trait StreamOutput: Send + Sync {
    /// Encoder-derived session parameters, queried right before
    /// connecting.
    fn encoder_params(&self) -> EncoderParams;

    /// Whether encoders and sources are ready for capture.
    fn can_begin_capture(&self) -> bool {
        true
    }

    fn begin_data_capture(&self);
    fn end_data_capture(&self);

    /// Terminal session signal; fired at most once per session.
    fn signal_stop(&self, reason: StopReason);

    /// Apply a bitrate change to the video encoder, in kbps.
    fn set_video_bitrate(&self, kbps: u32);
}

/// Errors from [`ZixiStream::new`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateError {
    #[error("the feeder library is not available")]
    FeederUnavailable,
}

/// Errors reported synchronously from [`ZixiStream::start`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartError {
    #[error("data capture cannot begin")]
    CannotBeginCapture,
    #[error("a session is already running")]
    AlreadyActive,
    #[error("failed to spawn a worker thread")]
    WorkerSpawn,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Shared session state
// ============================================================================

/// Session flags shared across the workers and the feeder callback.
pub(crate) struct StreamFlags {
    connecting: AtomicBool,
    active: AtomicBool,
    disconnected: AtomicBool,
    stop: AtomicBool,
}

impl StreamFlags {
    fn new() -> Self {
        Self {
            connecting: AtomicBool::new(false),
            active: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub(crate) fn connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    pub(crate) fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub(crate) fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Atomic telemetry counters, snapshot-read by the host at any time.
struct Telemetry {
    total_bytes_sent: AtomicU64,
    packet_alloc: AtomicU64,
    packet_free: AtomicU64,
    last_dropped_packets: AtomicU64,
    now_dropped_packets: AtomicU64,
    congested_start_ns: AtomicU64,
    last_stats_query_ns: AtomicU64,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            total_bytes_sent: AtomicU64::new(0),
            packet_alloc: AtomicU64::new(0),
            packet_free: AtomicU64::new(0),
            last_dropped_packets: AtomicU64::new(0),
            now_dropped_packets: AtomicU64::new(0),
            congested_start_ns: AtomicU64::new(0),
            last_stats_query_ns: AtomicU64::new(0),
        }
    }
}

/// Configuration frozen for the lifetime of one session.
struct SessionState {
    config: StreamConfig,
    url: ZixiUrl,
}

struct Shared {
    output: Arc<dyn StreamOutput>,
    flags: Arc<StreamFlags>,
    feedback: Arc<FeedbackController>,
    telemetry: Telemetry,
    queue: Mutex<PacketQueue>,
    queue_signal: Condvar,
    session: Mutex<Option<Arc<SessionState>>>,
    connect_thread: Mutex<Option<JoinHandle<()>>>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
}

// ============================================================================
// Public stream handle
// ============================================================================

/// One Zixi output stream.
///
/// The handle is `Send + Sync`: the host submits packets from its encoder
/// thread while controlling the lifecycle from another. Dropping the
/// stream joins every worker.
pub struct ZixiStream {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    base_config: StreamConfig,
}

impl ZixiStream {
    /// Create a stream over the dynamically loaded feeder.
    pub fn new(settings: &Settings, output: Arc<dyn StreamOutput>) -> Result<Self, CreateError> {
        let feeder = ZixiFeeder::new().ok_or(CreateError::FeederUnavailable)?;
        Ok(Self::with_transport(settings, output, Arc::new(feeder)))
    }

    /// Create a stream over an explicit transport implementation.
    pub fn with_transport(
        settings: &Settings,
        output: Arc<dyn StreamOutput>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        transport.configure_logging();

        let flags = Arc::new(StreamFlags::new());
        let feedback = Arc::new(FeedbackController::new(output.clone(), flags.clone()));
        let shared = Arc::new(Shared {
            output,
            flags,
            feedback,
            telemetry: Telemetry::new(),
            queue: Mutex::new(PacketQueue::new()),
            queue_signal: Condvar::new(),
            session: Mutex::new(None),
            connect_thread: Mutex::new(None),
            send_thread: Mutex::new(None),
        });

        info!("zixi stream created");
        Self {
            shared,
            transport,
            base_config: StreamConfig::from_settings(settings),
        }
    }

    /// Validate the configuration and kick off the connect worker.
    ///
    /// Configuration problems surface here synchronously; connect and
    /// transport failures arrive later through
    /// [`StreamOutput::signal_stop`].
    pub fn start(&self) -> Result<(), StartError> {
        let flags = &self.shared.flags;
        if flags.connecting() || flags.active() {
            return Err(StartError::AlreadyActive);
        }
        if !self.shared.output.can_begin_capture() {
            return Err(StartError::CannotBeginCapture);
        }

        let mut config = self.base_config.clone();
        let params = self.shared.output.encoder_params();
        config.apply_encoder_params(&params);
        let url = config.validate()?;

        // workers of a finished session may still hold their handles
        let leftover = self.shared.send_thread.lock().take();
        if let Some(handle) = leftover {
            debug!("joining sender left over from the previous session");
            let _ = handle.join();
        }
        let leftover = self.shared.connect_thread.lock().take();
        if let Some(handle) = leftover {
            let _ = handle.join();
        }

        self.reset_session_counters();

        let session = Arc::new(SessionState { config, url });
        *self.shared.session.lock() = Some(session.clone());

        info!("starting connect thread");
        flags.connecting.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let transport = self.transport.clone();
        let handle = thread::Builder::new()
            .name("zixi-connect".to_string())
            .spawn(move || connect_thread_main(shared, transport, session))
            .map_err(|_| {
                self.shared.flags.connecting.store(false, Ordering::SeqCst);
                StartError::WorkerSpawn
            })?;
        *self.shared.connect_thread.lock() = Some(handle);
        Ok(())
    }

    /// Hand one encoded packet to the session. Best-effort: silently a
    /// no-op once the session disconnected or a stop was requested.
    ///
    /// Audio payloads get their ADTS prefix here, on the producer thread;
    /// video is rebased later on the send path.
    pub fn submit_packet(&self, mut packet: EncodedPacket) {
        let flags = &self.shared.flags;
        if flags.disconnected() {
            return;
        }

        if packet.kind == PacketKind::Audio {
            let session = self.shared.session.lock().clone();
            let Some(session) = session else {
                return;
            };
            packet.payload = wrap_adts(
                &packet.payload,
                session.config.audio_channels,
                session.config.audio_sample_rate,
            );
        }

        self.shared
            .telemetry
            .packet_alloc
            .fetch_add(1, Ordering::Relaxed);

        let added = {
            let mut queue = self.shared.queue.lock();
            if !flags.disconnected() && !flags.stopping() {
                queue.push(packet)
            } else {
                self.shared
                    .telemetry
                    .packet_free
                    .fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        if added {
            self.shared.queue_signal.notify_one();
        }
    }

    /// Stop the session. Idempotent; joins the workers it stops, so the
    /// feeder handle is closed when this call returns.
    pub fn stop(&self) {
        info!("zixi stream stop requested");
        if self.shared.flags.stopping() {
            info!("stop already requested");
            return;
        }

        if self.shared.flags.connecting() {
            debug!("stop while connecting, joining connect thread");
            let handle = self.shared.connect_thread.lock().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }

        self.shared.flags.stop.store(true, Ordering::SeqCst);

        if self.shared.flags.active() {
            self.shared.feedback.allow_callbacks(false);
            self.shared.output.end_data_capture();
            self.shared.queue_signal.notify_all();
            let handle = self.shared.send_thread.lock().take();
            if let Some(handle) = handle {
                debug!("joining send thread");
                let _ = handle.join();
            }
        }
        info!("zixi stream stopped");
    }

    /// Bytes handed to the feeder so far this session.
    pub fn total_bytes(&self) -> u64 {
        self.shared.telemetry.total_bytes_sent.load(Ordering::Relaxed)
    }

    /// Frames discarded by the drop policy this session.
    pub fn dropped_frames(&self) -> u32 {
        self.shared.queue.lock().dropped_frames()
    }

    /// Whether a session is currently delivering.
    pub fn active(&self) -> bool {
        self.shared.flags.active()
    }

    /// Fraction of raw frames the source should keep, per the encoder
    /// feedback loop. The pre-drop policy itself lives with the source.
    pub fn decimation_factor(&self) -> f32 {
        self.shared.feedback.decimation_factor()
    }

    /// Congestion in [0, 1]. Holds 1.0 for five seconds after any stats
    /// interval in which the feeder lost packets; with encoder feedback
    /// enabled it otherwise reflects how far the link pushed the encoder
    /// below its nominal rate.
    pub fn congestion(&self) -> f32 {
        let t = &self.shared.telemetry;
        let now = now_ns();

        let mut congestion = 0.0f32;
        if t.last_dropped_packets.load(Ordering::Relaxed)
            < t.now_dropped_packets.load(Ordering::Relaxed)
        {
            t.congested_start_ns.store(now, Ordering::Relaxed);
            congestion = 1.0;
        } else {
            let start = t.congested_start_ns.load(Ordering::Relaxed);
            if start != 0 && now.saturating_sub(start) < TIME_TO_CLEAR_CONGESTION_NS {
                congestion = 1.0;
            }
        }

        if congestion != 1.0 {
            let session = self.shared.session.lock().clone();
            if let Some(session) = session {
                if session.config.encoder_feedback && session.config.video_bitrate > 0 {
                    let ratio = self.shared.feedback.last_sent_bps() as f32
                        / session.config.video_bitrate as f32;
                    congestion = 1.0 - ratio;
                }
            }
        }

        congestion.clamp(0.0, 1.0)
    }

    fn reset_session_counters(&self) {
        let t = &self.shared.telemetry;
        t.total_bytes_sent.store(0, Ordering::Relaxed);
        t.packet_alloc.store(0, Ordering::Relaxed);
        t.packet_free.store(0, Ordering::Relaxed);
        self.shared.flags.disconnected.store(false, Ordering::SeqCst);
        self.shared.flags.stop.store(false, Ordering::SeqCst);
        *self.shared.queue.lock() = PacketQueue::new();
        self.shared.feedback.reset();
    }

    #[cfg(test)]
    fn packet_accounting(&self) -> (u64, u64) {
        let alloc = self.shared.telemetry.packet_alloc.load(Ordering::Relaxed);
        let free = self.shared.telemetry.packet_free.load(Ordering::Relaxed)
            + self.shared.queue.lock().released_packets();
        (alloc, free)
    }
}

impl Drop for ZixiStream {
    fn drop(&mut self) {
        info!("zixi stream destroy");
        self.stop();

        // stop() skips workers that already wound down on their own; the
        // owner still holds their handles and must join them
        let handle = self.shared.connect_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let handle = self.shared.send_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let mut queue = self.shared.queue.lock();
        queue.drain();
        let free =
            self.shared.telemetry.packet_free.load(Ordering::Relaxed) + queue.released_packets();
        drop(queue);

        debug!(
            "packet alloc/free {}/{}",
            self.shared.telemetry.packet_alloc.load(Ordering::Relaxed),
            free
        );
        info!("zixi stream destroyed");
    }
}

// ============================================================================
// Connect worker
// ============================================================================

fn connect_thread_main(
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionState>,
) {
    info!("zixi connect thread started");

    if let Err(reason) = try_connect(&shared, &transport, &session) {
        info!("connection to {} failed: {:?}", session.config.url, reason);
        shared.output.signal_stop(reason);
    }

    shared.flags.connecting.store(false, Ordering::SeqCst);
    info!("zixi connect thread done");
}

fn try_connect(
    shared: &Arc<Shared>,
    transport: &Arc<dyn Transport>,
    session: &Arc<SessionState>,
) -> Result<(), StopReason> {
    let cfg = &session.config;
    if cfg.url.is_empty() {
        warn!("URL is empty");
        return Err(StopReason::BadPath);
    }

    info!("connecting to zixi URL {}", cfg.url);
    transport.configure_logging();
    if let Some((_, minor, minor_minor, build)) = transport.version() {
        info!("feeder version: {}.{}.{}", minor, minor_minor, build);
    }
    info!("bonding is {}", if cfg.bonding { "on" } else { "off" });

    let transport_cfg = build_transport_config(cfg, &session.url);
    info!("session bitrate cap is {} bps", transport_cfg.max_bitrate);

    let feedback_hook: Option<Arc<dyn BitrateFeedback>> = if cfg.encoder_feedback {
        info!("encoder feedback enabled");
        shared.feedback.arm(cfg.video_bitrate);
        Some(shared.feedback.clone())
    } else {
        None
    };

    let feeder_session = transport
        .open(&transport_cfg, cfg.rtmp.as_ref(), feedback_hook)
        .map_err(|code| {
            warn!("feeder refused the session: {}", code);
            StopReason::ConnectError(code)
        })?;

    // the host may have requested a stop while the feeder was connecting;
    // dropping the session here closes it without ever going active
    if shared.flags.stopping() {
        debug!("stop arrived during connect, closing session");
        return Ok(());
    }

    // callbacks may arrive as soon as the sender exists
    shared.feedback.allow_callbacks(true);

    let worker_shared = shared.clone();
    let worker_session = session.clone();
    let handle = thread::Builder::new()
        .name("zixi-send".to_string())
        .spawn(move || send_thread_main(worker_shared, worker_session, feeder_session))
        .map_err(|_| {
            shared.feedback.allow_callbacks(false);
            warn!("failed to create send thread");
            StopReason::ConnectError(-1)
        })?;
    *shared.send_thread.lock() = Some(handle);

    shared.flags.active.store(true, Ordering::SeqCst);
    info!("starting data capture");
    shared.output.begin_data_capture();
    Ok(())
}

// ============================================================================
// Sender worker
// ============================================================================

fn send_thread_main(
    shared: Arc<Shared>,
    session: Arc<SessionState>,
    mut feeder_session: Box<dyn TransportSession>,
) {
    info!("zixi send thread started");
    raise_sender_priority();

    let cfg = &session.config;
    let mut last_bond_scan_us: Option<u64> = None;

    loop {
        let packet = {
            let mut queue = shared.queue.lock();
            while queue.is_empty() && !shared.flags.stopping() {
                shared.queue_signal.wait(&mut queue);
            }
            if shared.flags.stopping() {
                break;
            }
            queue.pop()
        };
        let Some(packet) = packet else {
            continue;
        };

        let (pts, dts) = rebased_timestamps(&packet);
        let outcome =
            feeder_session.send_elementary_frame(&packet.payload, packet.is_video(), pts, dts);
        shared.telemetry.packet_free.fetch_add(1, Ordering::Relaxed);

        match outcome {
            SendOutcome::Sent => {}
            SendOutcome::NotReady | SendOutcome::OverLimit => {
                debug!("feeder backpressure: {:?}", outcome);
            }
            SendOutcome::Failed(code) => {
                error!("zixi send failed: {}", code);
                shared.feedback.mark_unsafe();
                shared.flags.disconnected.store(true, Ordering::SeqCst);
                break;
            }
        }
        shared
            .telemetry
            .total_bytes_sent
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);

        poll_statistics(&shared, feeder_session.as_mut());
        if cfg.bonding {
            maybe_rescan_bonded_ips(&mut last_bond_scan_us, feeder_session.as_mut());
        }
    }

    info!("zixi send thread work done");
    shared.flags.disconnected.store(true, Ordering::SeqCst);

    shared.queue.lock().drain();

    drop(feeder_session);
    info!("feeder session closed");

    if !shared.flags.stopping() {
        info!("disconnected from {}", cfg.url);
        shared.output.signal_stop(StopReason::Disconnected);
    } else {
        info!("stream stopped by the host");
    }

    shared.flags.active.store(false, Ordering::SeqCst);
    info!("zixi send thread done");
}

/// Query error-correction stats once per interval; on failure the
/// counters stay untouched until the next attempt.
fn poll_statistics(shared: &Arc<Shared>, feeder_session: &mut dyn TransportSession) {
    let t = &shared.telemetry;
    let now = now_ns();
    if now.saturating_sub(t.last_stats_query_ns.load(Ordering::Relaxed)) <= STATS_QUERY_INTERVAL_NS {
        return;
    }
    if let Ok(stats) = feeder_session.error_correction_stats() {
        t.last_stats_query_ns.store(now, Ordering::Relaxed);
        let now_dropped = t.now_dropped_packets.load(Ordering::Relaxed);
        t.last_dropped_packets.store(now_dropped, Ordering::Relaxed);
        t.now_dropped_packets.store(stats.not_recovered, Ordering::Relaxed);
    }
}

fn maybe_rescan_bonded_ips(
    last_scan_us: &mut Option<u64>,
    feeder_session: &mut dyn TransportSession,
) {
    let now_us = now_ns() / 1000;
    let due = match *last_scan_us {
        None => true,
        Some(at) => now_us.saturating_sub(at) > TIME_BETWEEN_AUTO_BOND_SCAN_US,
    };
    if !due {
        return;
    }
    *last_scan_us = Some(now_us);
    match feeder_session.rescan_bonded_ips() {
        Ok(()) => debug!("bonded interface rescan ok"),
        Err(code) => warn!("bonded interface rescan failed: {}", code),
    }
}

#[cfg(target_os = "linux")]
fn raise_sender_priority() {
    unsafe {
        libc::nice(-20);
    }
}

#[cfg(target_os = "windows")]
fn raise_sender_priority() {
    use windows_sys::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };
    unsafe {
        SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
fn raise_sender_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::feeder_bindings::ZixiErrorCorrectionStats;
    use crate::packet::{NAL_PRIORITY_HIGH, NAL_PRIORITY_HIGHEST};
    use crate::settings::{Settings, SETTING_ENCRYPTION_ID, SETTING_URL};
    use std::time::Duration;

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockTransportState {
        open_configs: Vec<TransportConfig>,
        sent: Vec<(bool, u64, u64, usize)>,
        send_count: usize,
    }

    struct MockTransport {
        state: Arc<Mutex<MockTransportState>>,
        open_error: Option<i32>,
        fail_send_at: Option<(usize, i32)>,
    }

    impl MockTransport {
        fn new() -> (Arc<Self>, Arc<Mutex<MockTransportState>>) {
            let state = Arc::new(Mutex::new(MockTransportState::default()));
            let transport = Arc::new(Self {
                state: state.clone(),
                open_error: None,
                fail_send_at: None,
            });
            (transport, state)
        }

        fn failing_open(code: i32) -> (Arc<Self>, Arc<Mutex<MockTransportState>>) {
            let state = Arc::new(Mutex::new(MockTransportState::default()));
            let transport = Arc::new(Self {
                state: state.clone(),
                open_error: Some(code),
                fail_send_at: None,
            });
            (transport, state)
        }

        fn failing_send(at: usize, code: i32) -> (Arc<Self>, Arc<Mutex<MockTransportState>>) {
            let state = Arc::new(Mutex::new(MockTransportState::default()));
            let transport = Arc::new(Self {
                state: state.clone(),
                open_error: None,
                fail_send_at: Some((at, code)),
            });
            (transport, state)
        }
    }

    impl Transport for MockTransport {
        fn open(
            &self,
            cfg: &TransportConfig,
            _rtmp: Option<&crate::config::RtmpForward>,
            _feedback: Option<Arc<dyn BitrateFeedback>>,
        ) -> Result<Box<dyn TransportSession>, i32> {
            self.state.lock().open_configs.push(cfg.clone());
            if let Some(code) = self.open_error {
                return Err(code);
            }
            Ok(Box::new(MockSession {
                state: self.state.clone(),
                fail_send_at: self.fail_send_at,
            }))
        }
    }

    struct MockSession {
        state: Arc<Mutex<MockTransportState>>,
        fail_send_at: Option<(usize, i32)>,
    }

    impl TransportSession for MockSession {
        fn send_elementary_frame(
            &mut self,
            payload: &[u8],
            video: bool,
            pts: u64,
            dts: u64,
        ) -> SendOutcome {
            let mut state = self.state.lock();
            state.send_count += 1;
            if let Some((at, code)) = self.fail_send_at {
                if state.send_count >= at {
                    return SendOutcome::from_code(code);
                }
            }
            state.sent.push((video, pts, dts, payload.len()));
            SendOutcome::Sent
        }

        fn error_correction_stats(&mut self) -> Result<ZixiErrorCorrectionStats, i32> {
            Ok(ZixiErrorCorrectionStats::default())
        }

        fn rescan_bonded_ips(&mut self) -> Result<(), i32> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockOutputState {
        signals: Vec<StopReason>,
        begin_capture: usize,
        end_capture: usize,
        bitrates_kbps: Vec<u32>,
    }

    struct MockOutput {
        state: Mutex<MockOutputState>,
        params: EncoderParams,
    }

    impl MockOutput {
        fn new(params: EncoderParams) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockOutputState::default()),
                params,
            })
        }
    }

    impl StreamOutput for MockOutput {
        fn encoder_params(&self) -> EncoderParams {
            self.params
        }

        fn begin_data_capture(&self) {
            self.state.lock().begin_capture += 1;
        }

        fn end_data_capture(&self) {
            self.state.lock().end_capture += 1;
        }

        fn signal_stop(&self, reason: StopReason) {
            self.state.lock().signals.push(reason);
        }

        fn set_video_bitrate(&self, kbps: u32) {
            self.state.lock().bitrates_kbps.push(kbps);
        }
    }

    fn default_params() -> EncoderParams {
        EncoderParams {
            video_bitrate: 2_000_000,
            max_video_bitrate: 0,
            audio_bitrate: 128_000,
            audio_channels: 2,
            audio_sample_rate: 48_000,
            dynamic_bitrate: false,
        }
    }

    fn basic_settings() -> Settings {
        let mut settings = Settings::new();
        settings.apply_defaults();
        settings.set_string(SETTING_URL, "zixi://h/c");
        settings
    }

    fn feedback_settings() -> Settings {
        let mut settings = basic_settings();
        settings.set_bool(crate::settings::SETTING_ENCODER_FEEDBACK, true);
        settings
    }

    fn feedback_params() -> EncoderParams {
        EncoderParams {
            video_bitrate: 4_000_000,
            dynamic_bitrate: true,
            ..default_params()
        }
    }

    // dts_usec spaced tightly so a stalled consumer never crosses the
    // drop threshold within one test
    fn video_packet(index: i64) -> EncodedPacket {
        EncodedPacket {
            kind: PacketKind::Video,
            payload: vec![0x65; 100],
            pts: index,
            dts: index,
            timebase_num: 1,
            timebase_den: 30,
            dts_usec: index * 1_000,
            keyframe: index == 0,
            priority: if index == 0 {
                NAL_PRIORITY_HIGHEST
            } else {
                NAL_PRIORITY_HIGH
            },
            drop_priority: if index == 0 {
                NAL_PRIORITY_HIGHEST
            } else {
                NAL_PRIORITY_HIGH
            },
            track_idx: 0,
        }
    }

    fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    // ------------------------------------------------------------------
    // Lifecycle scenarios
    // ------------------------------------------------------------------

    #[test]
    fn test_start_opens_session_and_sends_in_order() {
        let (transport, transport_state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        for i in 0..100 {
            stream.submit_packet(video_packet(i));
        }
        assert!(wait_until(Duration::from_secs(5), || {
            transport_state.lock().sent.len() == 100
        }));

        {
            let state = transport_state.lock();
            assert_eq!(state.open_configs.len(), 1);
            assert_eq!(state.open_configs[0].max_bitrate, 2_703_200);
            assert_eq!(state.open_configs[0].host, "h");
            assert_eq!(state.open_configs[0].port, 2088);
            assert_eq!(state.open_configs[0].channel, "c");
            // delivered in submission order, 90 kHz rebased
            for (i, frame) in state.sent.iter().enumerate() {
                assert!(frame.0);
                assert_eq!(frame.1, i as u64 * 3000);
            }
        }
        assert_eq!(stream.dropped_frames(), 0);
        assert_eq!(stream.total_bytes(), 100 * 100);
        assert_eq!(output.state.lock().begin_capture, 1);

        stream.stop();
        assert!(output.state.lock().signals.is_empty());
    }

    #[test]
    fn test_audio_frames_carry_adts_headers() {
        let (transport, transport_state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output, transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        stream.submit_packet(EncodedPacket {
            kind: PacketKind::Audio,
            payload: vec![0x21; 371],
            pts: 1024,
            dts: 1024,
            timebase_num: 1,
            timebase_den: 48_000,
            dts_usec: 21_333,
            keyframe: false,
            priority: NAL_PRIORITY_HIGHEST,
            drop_priority: NAL_PRIORITY_HIGHEST,
            track_idx: 1,
        });

        assert!(wait_until(Duration::from_secs(5), || {
            !transport_state.lock().sent.is_empty()
        }));
        let state = transport_state.lock();
        let (video, pts, _dts, size) = state.sent[0];
        assert!(!video);
        assert_eq!(pts, 1920);
        assert_eq!(size, 371 + 7);
    }

    #[test]
    fn test_encryption_without_key_rejected_before_transport() {
        let (transport, transport_state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let mut settings = basic_settings();
        settings.set_int(SETTING_ENCRYPTION_ID, 2);
        let stream = ZixiStream::with_transport(&settings, output, transport);

        assert_eq!(
            stream.start(),
            Err(StartError::Config(ConfigError::MissingEncryptionKey))
        );
        assert!(transport_state.lock().open_configs.is_empty());
    }

    #[test]
    fn test_bad_url_rejected_synchronously() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let mut settings = Settings::new();
        settings.set_string(SETTING_URL, "zixi://host");
        let stream = ZixiStream::with_transport(&settings, output, transport);

        assert!(matches!(
            stream.start(),
            Err(StartError::Config(ConfigError::BadUrl(_)))
        ));
    }

    #[test]
    fn test_connect_error_surfaces_feeder_code() {
        // the feeder returned 17; the transport layer negates it
        let (transport, _state) = MockTransport::failing_open(-17);
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            !output.state.lock().signals.is_empty()
        }));

        let state = output.state.lock();
        assert_eq!(state.signals, vec![StopReason::ConnectError(-17)]);
        assert_eq!(state.begin_capture, 0);
        drop(state);
        assert!(!stream.active());
        // the sender never ran, so there is nothing parked to join
        assert!(stream.shared.send_thread.lock().is_none());
    }

    #[test]
    fn test_send_error_disconnects_exactly_once() {
        let (transport, transport_state) = MockTransport::failing_send(10, 5);
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        for i in 0..20 {
            stream.submit_packet(video_packet(i));
        }

        assert!(wait_until(Duration::from_secs(5), || {
            stream.shared.flags.disconnected() && !stream.active()
        }));
        assert_eq!(output.state.lock().signals, vec![StopReason::Disconnected]);
        assert_eq!(transport_state.lock().sent.len(), 9);

        // best-effort no-op after the disconnect
        let (alloc_before, _) = stream.packet_accounting();
        stream.submit_packet(video_packet(99));
        let (alloc_after, _) = stream.packet_accounting();
        assert_eq!(alloc_before, alloc_after);

        drop(stream);
        assert_eq!(output.state.lock().signals, vec![StopReason::Disconnected]);
    }

    #[test]
    fn test_packet_accounting_balances_after_disconnect() {
        let (transport, _state) = MockTransport::failing_send(10, 5);
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output, transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        for i in 0..20 {
            stream.submit_packet(video_packet(i));
        }
        assert!(wait_until(Duration::from_secs(5), || !stream.active()));

        let (alloc, free) = stream.packet_accounting();
        assert_eq!(alloc, free);
    }

    #[test]
    fn test_user_stop_joins_and_emits_no_signal() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        for i in 0..5 {
            stream.submit_packet(video_packet(i));
        }

        stream.stop();
        assert!(!stream.active());
        {
            let state = output.state.lock();
            assert!(state.signals.is_empty());
            assert_eq!(state.end_capture, 1);
        }

        // idempotent
        stream.stop();
        assert_eq!(output.state.lock().end_capture, 1);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output, transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        assert_eq!(stream.start(), Err(StartError::AlreadyActive));
        stream.stop();
    }

    #[test]
    fn test_restart_after_stop() {
        let (transport, transport_state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output, transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        stream.stop();
        assert!(!stream.active());

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        stream.stop();
        assert_eq!(transport_state.lock().open_configs.len(), 2);
    }

    // ------------------------------------------------------------------
    // Congestion
    // ------------------------------------------------------------------

    #[test]
    fn test_congestion_reports_drop_deltas() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(default_params());
        let stream = ZixiStream::with_transport(&basic_settings(), output, transport);

        assert_eq!(stream.congestion(), 0.0);

        let t = &stream.shared.telemetry;
        t.last_dropped_packets.store(10, Ordering::Relaxed);
        t.now_dropped_packets.store(25, Ordering::Relaxed);
        assert_eq!(stream.congestion(), 1.0);

        // delta cleared but still inside the five-second hold
        t.last_dropped_packets.store(25, Ordering::Relaxed);
        assert_eq!(stream.congestion(), 1.0);

        // hold expired
        let stale = now_ns().saturating_sub(TIME_TO_CLEAR_CONGESTION_NS + 1_000_000_000);
        t.congested_start_ns.store(stale, Ordering::Relaxed);
        assert_eq!(stream.congestion(), 0.0);
    }

    #[test]
    fn test_congestion_reflects_feedback_ratio() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(feedback_params());
        let stream = ZixiStream::with_transport(&feedback_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        // the feeder steered the encoder down to 2 Mbps of 4 Mbps nominal
        stream.shared.feedback.on_transport_feedback(1_000_000, false);
        let congestion = stream.congestion();
        assert!((congestion - 0.5).abs() < 1e-6);
        stream.stop();
    }

    // ------------------------------------------------------------------
    // Encoder feedback
    // ------------------------------------------------------------------

    #[test]
    fn test_feedback_clamps_to_half_video_bitrate() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(feedback_params());
        let stream = ZixiStream::with_transport(&feedback_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        stream.shared.feedback.on_transport_feedback(1_000_000, false);

        assert_eq!(output.state.lock().bitrates_kbps, vec![2000]);
        assert_eq!(stream.shared.feedback.last_sent_bps(), 2_000_000);
        assert!((stream.decimation_factor() - 0.5).abs() < 1e-6);
        stream.stop();
    }

    #[test]
    fn test_feedback_ignored_before_session_goes_active() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(feedback_params());
        let stream = ZixiStream::with_transport(&feedback_settings(), output.clone(), transport);

        stream.shared.feedback.on_transport_feedback(1_000_000, false);
        assert!(output.state.lock().bitrates_kbps.is_empty());
        assert_eq!(stream.decimation_factor(), 1.0);
    }

    #[test]
    fn test_feedback_suppressed_after_stop() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(feedback_params());
        let stream = ZixiStream::with_transport(&feedback_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));
        stream.stop();

        stream.shared.feedback.on_transport_feedback(1_000_000, false);
        assert!(output.state.lock().bitrates_kbps.is_empty());
    }

    #[test]
    fn test_repeated_feedback_value_sent_once() {
        let (transport, _state) = MockTransport::new();
        let output = MockOutput::new(feedback_params());
        let stream = ZixiStream::with_transport(&feedback_settings(), output.clone(), transport);

        stream.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || stream.active()));

        stream.shared.feedback.on_transport_feedback(3_000_000, false);
        stream.shared.feedback.on_transport_feedback(3_000_000, false);
        assert_eq!(output.state.lock().bitrates_kbps, vec![3000]);
        stream.stop();
    }
}
