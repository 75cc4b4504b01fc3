//! Per-session configuration: the validated stream settings, the latency
//! and encryption tables, and the transport parameters derived from them.

use std::sync::OnceLock;

use thiserror::Error;

use crate::settings::{self, Settings};
use crate::url::{UrlError, ZixiUrl};

/// Latency presets offered to the user, indexed by `zixi_latency_id`.
pub const ZIXI_LATENCIES_MS: [u32; 17] = [
    100, 200, 300, 500, 1000, 1500, 2000, 2500, 3000, 4000, 5000, 6000, 8000, 10000, 12000, 14000,
    16000,
];

const DEFAULT_LATENCY_MS: u32 = 2000;

/// Map a latency id to milliseconds; out-of-range ids fall back to 2000 ms.
pub fn latency_from_id(id: i64) -> u32 {
    usize::try_from(id)
        .ok()
        .and_then(|idx| ZIXI_LATENCIES_MS.get(idx).copied())
        .unwrap_or(DEFAULT_LATENCY_MS)
}

/// Link encryption modes, indexed by `zixi_encryption_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Aes128,
    Aes192,
    Aes256,
    None,
}

impl Encryption {
    /// Map an encryption id; out-of-range ids disable encryption.
    pub fn from_id(id: i64) -> Self {
        match id {
            0 => Encryption::Aes128,
            1 => Encryption::Aes192,
            2 => Encryption::Aes256,
            _ => Encryption::None,
        }
    }
}

/// Problems with the configuration detected before any transport work.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stream URL is empty")]
    MissingUrl,
    #[error("invalid stream URL: {0}")]
    BadUrl(#[from] UrlError),
    #[error("encryption is enabled but the key is empty")]
    MissingEncryptionKey,
}

/// Encoder-derived parameters queried from the host right before a session
/// starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderParams {
    /// Video bitrate in bps.
    pub video_bitrate: u32,
    /// Peak video bitrate in bps; 0 means "same as `video_bitrate`".
    pub max_video_bitrate: u32,
    /// Sum of all audio track bitrates in bps.
    pub audio_bitrate: u32,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
    /// Whether the video encoder accepts bitrate changes mid-stream.
    pub dynamic_bitrate: bool,
}

/// RTMP bridge destination used when forwarding is enabled.
#[derive(Debug, Clone)]
pub struct RtmpForward {
    pub url: String,
    pub stream_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Immutable per-session configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    pub password: Option<String>,
    pub latency_ms: u32,
    pub encryption: Encryption,
    pub encryption_key: Option<String>,
    pub bonding: bool,
    pub encoder_feedback: bool,
    pub rtmp: Option<RtmpForward>,
    pub video_bitrate: u32,
    pub max_video_bitrate: u32,
    pub audio_bitrate: u32,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl StreamConfig {
    /// Read the session settings from the host's bag. Encoder-derived
    /// fields stay zero until [`StreamConfig::apply_encoder_params`].
    pub fn from_settings(s: &Settings) -> Self {
        let encryption = Encryption::from_id(s.get_int(settings::SETTING_ENCRYPTION_ID));
        let encryption_key = if encryption != Encryption::None {
            non_empty(s.get_string(settings::SETTING_ENCRYPTION_KEY))
        } else {
            None
        };

        let rtmp = if s.get_bool(settings::SETTING_RTMP_FORWARD) {
            Some(RtmpForward {
                url: s.get_string(settings::SETTING_RTMP_SERVER).to_string(),
                stream_name: s.get_string(settings::SETTING_RTMP_KEY).to_string(),
                username: non_empty(s.get_string(settings::SETTING_RTMP_USERNAME)),
                password: non_empty(s.get_string(settings::SETTING_RTMP_PASSWORD)),
            })
        } else {
            None
        };

        Self {
            url: s.get_string(settings::SETTING_URL).to_string(),
            password: non_empty(s.get_string(settings::SETTING_PASSWORD)),
            latency_ms: latency_from_id(s.get_int(settings::SETTING_LATENCY_ID)),
            encryption,
            encryption_key,
            bonding: s.get_bool(settings::SETTING_BONDING),
            encoder_feedback: s.get_bool(settings::SETTING_ENCODER_FEEDBACK),
            rtmp,
            video_bitrate: 0,
            max_video_bitrate: 0,
            audio_bitrate: 0,
            audio_channels: 0,
            audio_sample_rate: 0,
        }
    }

    /// Fold in what the encoders report at start time. Feedback stays
    /// enabled only when the video encoder can actually apply it.
    pub fn apply_encoder_params(&mut self, params: &EncoderParams) {
        self.video_bitrate = params.video_bitrate;
        self.max_video_bitrate = if params.max_video_bitrate == 0 {
            params.video_bitrate
        } else {
            params.max_video_bitrate
        };
        self.audio_bitrate = params.audio_bitrate;
        self.audio_channels = params.audio_channels;
        self.audio_sample_rate = params.audio_sample_rate;
        self.encoder_feedback &= params.dynamic_bitrate;
    }

    /// Check everything that can fail before the feeder is touched.
    pub fn validate(&self) -> Result<ZixiUrl, ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        let url = ZixiUrl::parse(&self.url)?;
        if self.encryption != Encryption::None && self.encryption_key.is_none() {
            return Err(ConfigError::MissingEncryptionKey);
        }
        Ok(url)
    }
}

// ============================================================================
// Transport parameter derivation
// ============================================================================

/// How the feeder adapts to the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveMode {
    /// Fixed encoder rate, FEC absorbs loss.
    Fec,
    /// Closed loop: the feeder steers the encoder bitrate.
    Encoder,
}

/// Bitrate controller block passed along with [`AdaptiveMode::Encoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub aggressiveness: i32,
    pub update_interval_ms: u32,
}

/// Session parameters for the feeder, fully derived and owned; the FFI
/// layer lowers this into the C structures at open time.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub channel: String,
    pub user_id: String,
    pub password: Option<String>,
    pub encryption: Encryption,
    pub encryption_key: Option<String>,
    pub max_latency_ms: u32,
    pub max_delay_packets: u32,
    pub max_bitrate: u32,
    /// Nominal A/V rate, used to size the RTMP bridge.
    pub total_bitrate: u32,
    pub adaptive: AdaptiveMode,
    pub fec_overhead: u32,
    pub fec_block_ms: u32,
    pub force_padding: bool,
    pub bonding: bool,
    pub audio_channels: u32,
    pub controller: Option<ControllerSettings>,
}

/// Derive the feeder session parameters from the validated configuration.
///
/// The delay window is sized in 7-packet TS bursts; the bitrate cap takes
/// the peak A/V rate with 15% protocol headroom plus a fixed floor.
pub fn build_transport_config(cfg: &StreamConfig, url: &ZixiUrl) -> TransportConfig {
    let total_bitrate = cfg.video_bitrate + cfg.audio_bitrate;
    let max_delay_packets = total_bitrate / (5 * 8 * 188 * 7);
    let max_bitrate =
        ((cfg.max_video_bitrate + cfg.audio_bitrate) as f64 * 1.15).round() as u32 + 256_000;

    let (adaptive, fec_overhead, force_padding, controller) = if cfg.encoder_feedback {
        let controller_max = (total_bitrate as u64 * 105 / 100) as u32;
        (
            AdaptiveMode::Encoder,
            5,
            true,
            Some(ControllerSettings {
                min_bitrate: controller_max / 4,
                max_bitrate: controller_max,
                aggressiveness: 20,
                update_interval_ms: 2000,
            }),
        )
    } else {
        (AdaptiveMode::Fec, 30, false, None)
    };

    TransportConfig {
        host: url.host.clone(),
        port: url.port,
        channel: url.channel.clone(),
        user_id: machine_id().to_string(),
        password: cfg.password.clone(),
        encryption: cfg.encryption,
        encryption_key: cfg.encryption_key.clone(),
        max_latency_ms: cfg.latency_ms,
        max_delay_packets,
        max_bitrate,
        total_bitrate,
        adaptive,
        fec_overhead,
        fec_block_ms: 100,
        force_padding,
        bonding: cfg.bonding,
        audio_channels: cfg.audio_channels,
        controller,
    }
}

// ============================================================================
// Machine identity
// ============================================================================

static MACHINE_ID: OnceLock<String> = OnceLock::new();

/// Identity reported to the broadcaster, `obs_<hostname>`. Built once per
/// process.
pub fn machine_id() -> &'static str {
    MACHINE_ID.get_or_init(|| format!("obs_{}", hostname()))
}

#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "UNKNOWN".to_string();
    }
    buf[buf.len() - 1] = 0;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
    if end == 0 {
        "UNKNOWN".to_string()
    } else {
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }
}

#[cfg(windows)]
fn hostname() -> String {
    #[link(name = "kernel32")]
    extern "system" {
        fn GetComputerNameA(lpBuffer: *mut u8, nSize: *mut u32) -> i32;
    }

    let mut buf = [0u8; 256];
    let mut size = buf.len() as u32 - 1;
    let ok = unsafe { GetComputerNameA(buf.as_mut_ptr(), &mut size) };
    if ok == 0 || size == 0 {
        "UNKNOWN".to_string()
    } else {
        String::from_utf8_lossy(&buf[..size as usize]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{
        Settings, SETTING_BONDING, SETTING_ENCRYPTION_ID, SETTING_ENCRYPTION_KEY,
        SETTING_LATENCY_ID, SETTING_RTMP_FORWARD, SETTING_RTMP_KEY, SETTING_RTMP_SERVER,
        SETTING_URL,
    };

    fn base_config() -> StreamConfig {
        let mut s = Settings::new();
        s.apply_defaults();
        s.set_string(SETTING_URL, "zixi://h/c");
        let mut cfg = StreamConfig::from_settings(&s);
        cfg.apply_encoder_params(&EncoderParams {
            video_bitrate: 2_000_000,
            max_video_bitrate: 0,
            audio_bitrate: 128_000,
            audio_channels: 2,
            audio_sample_rate: 48_000,
            dynamic_bitrate: false,
        });
        cfg
    }

    #[test]
    fn test_latency_table() {
        assert_eq!(latency_from_id(0), 100);
        assert_eq!(latency_from_id(4), 1000);
        assert_eq!(latency_from_id(6), 2000);
        assert_eq!(latency_from_id(16), 16000);
        assert_eq!(latency_from_id(17), 2000);
        assert_eq!(latency_from_id(-1), 2000);
    }

    #[test]
    fn test_encryption_ids() {
        assert_eq!(Encryption::from_id(0), Encryption::Aes128);
        assert_eq!(Encryption::from_id(2), Encryption::Aes256);
        assert_eq!(Encryption::from_id(3), Encryption::None);
        assert_eq!(Encryption::from_id(42), Encryption::None);
    }

    #[test]
    fn test_session_bitrate_arithmetic() {
        let cfg = base_config();
        let url = cfg.validate().unwrap();
        let tc = build_transport_config(&cfg, &url);
        assert_eq!(tc.max_bitrate, 2_703_200);
        assert_eq!(tc.max_delay_packets, 2_128_000 / (5 * 8 * 188 * 7));
        assert_eq!(tc.adaptive, AdaptiveMode::Fec);
        assert_eq!(tc.fec_overhead, 30);
        assert_eq!(tc.fec_block_ms, 100);
        assert!(tc.controller.is_none());
    }

    #[test]
    fn test_encoder_feedback_controller_block() {
        let mut cfg = base_config();
        cfg.encoder_feedback = true;
        let url = cfg.validate().unwrap();
        let tc = build_transport_config(&cfg, &url);
        assert_eq!(tc.adaptive, AdaptiveMode::Encoder);
        assert_eq!(tc.fec_overhead, 5);
        assert!(tc.force_padding);
        let ctrl = tc.controller.unwrap();
        assert_eq!(ctrl.max_bitrate, 2_128_000 * 105 / 100);
        assert_eq!(ctrl.min_bitrate, ctrl.max_bitrate / 4);
        assert_eq!(ctrl.aggressiveness, 20);
        assert_eq!(ctrl.update_interval_ms, 2000);
    }

    #[test]
    fn test_feedback_requires_dynamic_bitrate() {
        let mut s = Settings::new();
        s.set_string(SETTING_URL, "zixi://h/c");
        s.set_bool(crate::settings::SETTING_ENCODER_FEEDBACK, true);
        let mut cfg = StreamConfig::from_settings(&s);
        cfg.apply_encoder_params(&EncoderParams {
            video_bitrate: 1_000_000,
            dynamic_bitrate: false,
            ..Default::default()
        });
        assert!(!cfg.encoder_feedback);
    }

    #[test]
    fn test_validate_rejects_missing_url() {
        let s = Settings::new();
        let cfg = StreamConfig::from_settings(&s);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingUrl));
    }

    #[test]
    fn test_validate_rejects_encryption_without_key() {
        let mut s = Settings::new();
        s.set_string(SETTING_URL, "zixi://h/c");
        s.set_int(SETTING_ENCRYPTION_ID, 2);
        let cfg = StreamConfig::from_settings(&s);
        assert_eq!(cfg.validate(), Err(ConfigError::MissingEncryptionKey));

        s.set_string(SETTING_ENCRYPTION_KEY, "0123456789abcdef");
        let cfg = StreamConfig::from_settings(&s);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed_url() {
        let mut s = Settings::new();
        s.set_string(SETTING_URL, "rtmp://h/c");
        let cfg = StreamConfig::from_settings(&s);
        assert!(matches!(cfg.validate(), Err(ConfigError::BadUrl(_))));
    }

    #[test]
    fn test_rtmp_forward_settings() {
        let mut s = Settings::new();
        s.set_string(SETTING_URL, "zixi://h/c");
        s.set_bool(SETTING_RTMP_FORWARD, true);
        s.set_string(SETTING_RTMP_SERVER, "rtmp://cdn.example.com/live");
        s.set_string(SETTING_RTMP_KEY, "stream-key");
        s.set_bool(SETTING_BONDING, true);
        s.set_int(SETTING_LATENCY_ID, 0);
        let cfg = StreamConfig::from_settings(&s);
        let fwd = cfg.rtmp.as_ref().unwrap();
        assert_eq!(fwd.url, "rtmp://cdn.example.com/live");
        assert_eq!(fwd.stream_name, "stream-key");
        assert!(fwd.username.is_none());
        assert!(cfg.bonding);
        assert_eq!(cfg.latency_ms, 100);
    }

    #[test]
    fn test_machine_id_prefix() {
        let id = machine_id();
        assert!(id.starts_with("obs_"));
        assert!(id.len() > 4);
    }
}
