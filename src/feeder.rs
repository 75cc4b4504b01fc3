//! Safe layer over the feeder bindings.
//!
//! The stream workers talk to [`Transport`] / [`TransportSession`] instead
//! of the raw function table, which keeps the session handle single-owner
//! (closed on drop) and lets tests swap in a mock transport.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::config::{AdaptiveMode, Encryption, RtmpForward, TransportConfig};
use crate::feeder_bindings as ffi;

/// Classified result of one elementary-frame submission.
///
/// `NotReady` and `OverLimit` mean the feeder consumed the frame and is
/// handling the condition internally; only `Failed` ends the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotReady,
    OverLimit,
    /// Hard feeder error, carried as a negative code.
    Failed(i32),
}

impl SendOutcome {
    pub fn from_code(code: c_int) -> Self {
        match code {
            ffi::ZIXI_ERROR_OK => SendOutcome::Sent,
            ffi::ZIXI_ERROR_NOT_READY => SendOutcome::NotReady,
            ffi::ZIXI_WARNING_OVER_LIMIT => SendOutcome::OverLimit,
            other => SendOutcome::Failed(negate(other)),
        }
    }

    /// Whether the frame counts as delivered for the byte totals.
    pub fn delivered(&self) -> bool {
        !matches!(self, SendOutcome::Failed(_))
    }
}

/// Feeder codes are positive integers; errors travel through the crate as
/// their negation.
fn negate(code: c_int) -> i32 {
    if code > 0 {
        -code
    } else {
        code
    }
}

/// Receiver of bandwidth hints arriving on a feeder thread.
pub trait BitrateFeedback: Send + Sync {
    fn on_transport_feedback(&self, total_bps: u32, force_iframe: bool);
}

/// One open feeder session. Sessions are owned by the sender worker and
/// close their native handle when dropped.
pub trait TransportSession: Send {
    fn send_elementary_frame(&mut self, payload: &[u8], video: bool, pts: u64, dts: u64)
        -> SendOutcome;

    fn error_correction_stats(&mut self) -> Result<ffi::ZixiErrorCorrectionStats, i32>;

    fn rescan_bonded_ips(&mut self) -> Result<(), i32>;
}

/// Factory for feeder sessions.
pub trait Transport: Send + Sync {
    /// Route the feeder's own log output into the host log.
    fn configure_logging(&self) {}

    /// Native library version, when one is loaded.
    fn version(&self) -> Option<(i32, i32, i32, i32)> {
        None
    }

    /// Open a session; a non-zero feeder return surfaces as the negated
    /// code.
    fn open(
        &self,
        cfg: &TransportConfig,
        rtmp: Option<&RtmpForward>,
        feedback: Option<Arc<dyn BitrateFeedback>>,
    ) -> Result<Box<dyn TransportSession>, i32>;
}

// ============================================================================
// Real feeder implementation
// ============================================================================

/// The dynamically loaded Zixi feeder.
pub struct ZixiFeeder;

impl ZixiFeeder {
    /// Bind to the feeder library; `None` when it is absent, in which case
    /// the Zixi output is simply not offered.
    pub fn new() -> Option<Self> {
        if ffi::init_feeder() {
            Some(Self)
        } else {
            None
        }
    }
}

unsafe extern "C" fn feeder_log_callback(_user: *mut c_void, level: c_int, message: *const c_char) {
    if message.is_null() {
        return;
    }
    let text = CStr::from_ptr(message).to_string_lossy();
    match level {
        ffi::ZIXI_LOG_DEBUG => debug!("feeder: {}", text),
        ffi::ZIXI_LOG_INFO => info!("feeder: {}", text),
        ffi::ZIXI_LOG_WARNINGS => warn!("feeder: {}", text),
        _ => error!("feeder: {}", text),
    }
}

unsafe extern "C" fn encoder_feedback_trampoline(
    total_bps: c_int,
    force_iframe: bool,
    param: *mut c_void,
) {
    if param.is_null() {
        return;
    }
    let sink = &*(param as *const Arc<dyn BitrateFeedback>);
    sink.on_transport_feedback(total_bps.max(0) as u32, force_iframe);
}

fn encryption_id(encryption: Encryption) -> std::ffi::c_uint {
    match encryption {
        Encryption::Aes128 => ffi::ZIXI_AES_128,
        Encryption::Aes192 => ffi::ZIXI_AES_192,
        Encryption::Aes256 => ffi::ZIXI_AES_256,
        Encryption::None => ffi::ZIXI_NO_ENCRYPTION,
    }
}

fn adaptive_id(adaptive: AdaptiveMode) -> c_int {
    match adaptive {
        AdaptiveMode::Fec => ffi::ZIXI_ADAPTIVE_FEC,
        AdaptiveMode::Encoder => ffi::ZIXI_ADAPTIVE_ENCODER,
    }
}

fn c_string(value: &str) -> Result<CString, i32> {
    CString::new(value).map_err(|_| -1)
}

fn optional_c_string(value: Option<&String>) -> Result<Option<CString>, i32> {
    value.map(|v| c_string(v)).transpose()
}

fn ptr_or_null(value: &Option<CString>) -> *const c_char {
    value.as_ref().map_or(ptr::null(), |v| v.as_ptr())
}

impl Transport for ZixiFeeder {
    fn configure_logging(&self) {
        if let Some(functions) = ffi::functions() {
            unsafe {
                (functions.configure_logging)(
                    ffi::ZIXI_LOG_INFO,
                    Some(feeder_log_callback),
                    ptr::null_mut(),
                );
            }
        }
    }

    fn version(&self) -> Option<(i32, i32, i32, i32)> {
        ffi::feeder_version()
    }

    fn open(
        &self,
        cfg: &TransportConfig,
        rtmp: Option<&RtmpForward>,
        feedback: Option<Arc<dyn BitrateFeedback>>,
    ) -> Result<Box<dyn TransportSession>, i32> {
        let functions = ffi::functions().ok_or(-1)?;

        // All pointer targets below live on this frame until the open call
        // returns; the feeder copies what it keeps.
        let user_id = c_string(&cfg.user_id)?;
        let stream_id = c_string(&cfg.channel)?;
        let host = c_string(&cfg.host)?;
        let encryption_key = optional_c_string(cfg.encryption_key.as_ref())?;
        let password = optional_c_string(cfg.password.as_ref())?;

        let hosts = [host.as_ptr()];
        let hosts_len = [cfg.host.len() as c_int];
        let ports = [cfg.port];

        // The feedback sink must outlive the session, not just this call;
        // the session guard keeps the boxed Arc alive for the trampoline.
        let feedback_holder: Option<Box<Arc<dyn BitrateFeedback>>> = feedback.map(Box::new);

        let mut enc_ctrl = match (cfg.controller.as_ref(), feedback_holder.as_ref()) {
            (Some(ctrl), Some(holder)) => Some(ffi::EncoderControlInfo {
                min_bitrate: ctrl.min_bitrate,
                max_bitrate: ctrl.max_bitrate,
                aggressiveness: ctrl.aggressiveness,
                update_interval: ctrl.update_interval_ms,
                setter: Some(encoder_feedback_trampoline),
                param: &**holder as *const Arc<dyn BitrateFeedback> as *mut c_void,
            }),
            _ => None,
        };
        let enc_ctrl_ptr = enc_ctrl
            .as_mut()
            .map_or(ptr::null_mut(), |ctrl| ctrl as *mut ffi::EncoderControlInfo);

        let c_cfg = ffi::ZixiStreamConfig {
            user_id: user_id.as_ptr(),
            enc_type: encryption_id(cfg.encryption),
            sz_enc_key: ptr_or_null(&encryption_key),
            max_latency_ms: cfg.max_latency_ms,
            port: ports.as_ptr(),
            sz_stream_id: stream_id.as_ptr(),
            stream_id_max_length: cfg.channel.len() as c_int,
            password: ptr_or_null(&password),
            sz_hosts: hosts.as_ptr(),
            hosts_len: hosts_len.as_ptr(),
            max_delay_packets: cfg.max_delay_packets,
            max_bitrate: cfg.max_bitrate,
            reconnect: 0,
            num_hosts: 1,
            use_compression: 1,
            elementary_streams: 1,
            limited: adaptive_id(cfg.adaptive),
            fec_overhead: cfg.fec_overhead,
            content_aware_fec: 0,
            fec_block_ms: cfg.fec_block_ms,
            force_bonding: cfg.bonding,
            local_nics: ptr::null(),
            num_local_nics: 0,
            force_padding: cfg.force_padding,
            enforce_bitrate: false,
            elementary_streams_config: ffi::ElementaryStreamsConfig {
                video_codec: ffi::ZIXI_VIDEO_CODEC_H264,
                audio_codec: ffi::ZIXI_AUDIO_CODEC_AAC,
                audio_channels: cfg.audio_channels,
                scte_enabled: false,
            },
        };

        let mut handle: *mut c_void = ptr::null_mut();
        let ret = match rtmp {
            Some(forward) => {
                let rtmp_url = c_string(&forward.url)?;
                let stream_name = c_string(&forward.stream_name)?;
                let user = optional_c_string(forward.username.as_ref())?;
                let rtmp_password = optional_c_string(forward.password.as_ref())?;

                let mut rtmp_cfg = ffi::ZixiRtmpOutConfig {
                    url: rtmp_url.as_ptr(),
                    stream_name: stream_name.as_ptr(),
                    user: ptr_or_null(&user),
                    password: ptr_or_null(&rtmp_password),
                    bitrate: cfg.total_bitrate,
                    max_va_diff: 10_000,
                };
                unsafe {
                    (functions.open_stream_with_rtmp)(c_cfg, enc_ctrl_ptr, &mut rtmp_cfg, &mut handle)
                }
            }
            None => unsafe { (functions.open_stream)(c_cfg, enc_ctrl_ptr, &mut handle) },
        };

        if ret != ffi::ZIXI_ERROR_OK {
            return Err(negate(ret));
        }
        if handle.is_null() {
            return Err(-1);
        }

        Ok(Box::new(FeederSession {
            handle,
            functions,
            _feedback: feedback_holder,
        }))
    }
}

/// Owning guard for one native stream handle.
struct FeederSession {
    handle: *mut c_void,
    functions: &'static ffi::FeederFunctions,
    _feedback: Option<Box<Arc<dyn BitrateFeedback>>>,
}

// The handle is only ever used from the sender worker that owns the guard.
unsafe impl Send for FeederSession {}

impl TransportSession for FeederSession {
    fn send_elementary_frame(
        &mut self,
        payload: &[u8],
        video: bool,
        pts: u64,
        dts: u64,
    ) -> SendOutcome {
        let ret = unsafe {
            (self.functions.send_elementary_frame)(
                self.handle,
                payload.as_ptr() as *const c_char,
                payload.len() as c_int,
                video,
                pts,
                dts,
            )
        };
        SendOutcome::from_code(ret)
    }

    fn error_correction_stats(&mut self) -> Result<ffi::ZixiErrorCorrectionStats, i32> {
        let mut stats = ffi::ZixiErrorCorrectionStats::default();
        let ret = unsafe {
            (self.functions.get_stats)(self.handle, ptr::null_mut(), ptr::null_mut(), &mut stats)
        };
        if ret == ffi::ZIXI_ERROR_OK {
            Ok(stats)
        } else {
            Err(negate(ret))
        }
    }

    fn rescan_bonded_ips(&mut self) -> Result<(), i32> {
        let ret = unsafe { (self.functions.set_automatic_ips)(self.handle) };
        if ret == ffi::ZIXI_ERROR_OK {
            Ok(())
        } else {
            Err(negate(ret))
        }
    }
}

impl Drop for FeederSession {
    fn drop(&mut self) {
        unsafe {
            (self.functions.close_stream)(self.handle);
        }
        self.handle = ptr::null_mut();
    }
}
