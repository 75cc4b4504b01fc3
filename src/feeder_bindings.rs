//! Raw bindings to the Zixi feeder library.
//!
//! The feeder is loaded dynamically once per process; when the library or
//! any of its entry points is missing, the transport is simply absent and
//! callers observe that through [`is_available`]. No symbol is touched
//! before [`init_feeder`] resolves the whole table.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

// ============================================================================
// Constants from the feeder interface
// ============================================================================

pub const ZIXI_ERROR_OK: c_int = 0;
/// Feeder is still buffering; the frame was consumed.
pub const ZIXI_ERROR_NOT_READY: c_int = 1;
/// Feeder accepted the frame above its configured rate.
pub const ZIXI_WARNING_OVER_LIMIT: c_int = 2;

pub const ZIXI_LOG_DEBUG: c_int = 0;
pub const ZIXI_LOG_INFO: c_int = 1;
pub const ZIXI_LOG_WARNINGS: c_int = 2;
#[allow(dead_code)]
pub const ZIXI_LOG_ERRORS: c_int = 3;
#[allow(dead_code)]
pub const ZIXI_LOG_FATAL: c_int = 4;

#[allow(dead_code)]
pub const ZIXI_ADAPTIVE_NONE: c_int = 0;
pub const ZIXI_ADAPTIVE_FEC: c_int = 1;
pub const ZIXI_ADAPTIVE_ENCODER: c_int = 2;

pub const ZIXI_AES_128: c_uint = 0;
pub const ZIXI_AES_192: c_uint = 1;
pub const ZIXI_AES_256: c_uint = 2;
pub const ZIXI_NO_ENCRYPTION: c_uint = 3;

pub const ZIXI_VIDEO_CODEC_H264: c_int = 1;
pub const ZIXI_AUDIO_CODEC_AAC: c_int = 1;

/// Microseconds between automatic NIC rescans while bonding.
pub const TIME_BETWEEN_AUTO_BOND_SCAN_US: u64 = 10_000_000;

// ============================================================================
// Feeder structures
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ElementaryStreamsConfig {
    pub video_codec: c_int,
    pub audio_codec: c_int,
    pub audio_channels: c_uint,
    pub scte_enabled: bool,
}

/// Session parameters handed to `zixi_open_stream` by value. All pointers
/// are borrowed for the duration of the call; the feeder copies what it
/// keeps.
#[repr(C)]
pub struct ZixiStreamConfig {
    pub user_id: *const c_char,
    pub enc_type: c_uint,
    pub sz_enc_key: *const c_char,
    pub max_latency_ms: c_uint,
    pub port: *const u16,
    pub sz_stream_id: *const c_char,
    pub stream_id_max_length: c_int,
    pub password: *const c_char,
    pub sz_hosts: *const *const c_char,
    pub hosts_len: *const c_int,
    pub max_delay_packets: c_uint,
    pub max_bitrate: c_uint,
    pub reconnect: c_int,
    pub num_hosts: c_int,
    pub use_compression: c_int,
    pub elementary_streams: c_int,
    pub limited: c_int,
    pub fec_overhead: c_uint,
    pub content_aware_fec: c_int,
    pub fec_block_ms: c_uint,
    pub force_bonding: bool,
    pub local_nics: *const *const c_char,
    pub num_local_nics: c_int,
    pub force_padding: bool,
    pub enforce_bitrate: bool,
    pub elementary_streams_config: ElementaryStreamsConfig,
}

/// Bandwidth hint callback invoked from a feeder thread.
pub type EncoderFeedbackFn =
    unsafe extern "C" fn(total_bps: c_int, force_iframe: bool, param: *mut c_void);

#[repr(C)]
pub struct EncoderControlInfo {
    pub min_bitrate: c_uint,
    pub max_bitrate: c_uint,
    pub aggressiveness: c_int,
    pub update_interval: c_uint,
    pub setter: Option<EncoderFeedbackFn>,
    pub param: *mut c_void,
}

#[repr(C)]
pub struct ZixiRtmpOutConfig {
    pub url: *const c_char,
    pub stream_name: *const c_char,
    pub user: *const c_char,
    pub password: *const c_char,
    pub bitrate: c_uint,
    pub max_va_diff: c_uint,
}

/// Error-correction counters returned by `zixi_get_stats`. Only
/// `not_recovered` feeds the congestion report; the rest is carried for
/// completeness.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ZixiErrorCorrectionStats {
    pub fec_recovered: u64,
    pub arq_recovered: u64,
    pub not_recovered: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
}

pub type LogCallbackFn =
    unsafe extern "C" fn(user_data: *mut c_void, level: c_int, message: *const c_char);

// ============================================================================
// Entry point types (the feeder's dynload surface)
// ============================================================================

pub type ConfigureLoggingFn =
    unsafe extern "C" fn(log_level: c_int, log_func: Option<LogCallbackFn>, user_data: *mut c_void) -> c_int;
pub type OpenStreamFn = unsafe extern "C" fn(
    parameters: ZixiStreamConfig,
    enc_ctrl: *mut EncoderControlInfo,
    out_stream_handle: *mut *mut c_void,
) -> c_int;
pub type OpenStreamWithRtmpFn = unsafe extern "C" fn(
    parameters: ZixiStreamConfig,
    enc_ctrl: *mut EncoderControlInfo,
    rtmp_out: *mut ZixiRtmpOutConfig,
    out_stream_handle: *mut *mut c_void,
) -> c_int;
pub type CloseStreamFn = unsafe extern "C" fn(stream_handle: *mut c_void) -> c_int;
pub type SetAutomaticIpsFn = unsafe extern "C" fn(stream_handle: *mut c_void) -> c_int;
pub type GetStatsFn = unsafe extern "C" fn(
    stream_handle: *mut c_void,
    conn_stats: *mut c_void,
    net_stats: *mut c_void,
    error_correction_stats: *mut ZixiErrorCorrectionStats,
) -> c_int;
pub type VersionFn = unsafe extern "C" fn(
    major: *mut c_int,
    minor: *mut c_int,
    minor_minor: *mut c_int,
    build: *mut c_int,
) -> c_int;
pub type SendElementaryFrameFn = unsafe extern "C" fn(
    stream_handle: *mut c_void,
    frame_buffer: *const c_char,
    buffer_length: c_int,
    video: bool,
    pts: u64,
    dts: u64,
) -> c_int;

/// Resolved feeder entry points. Present as a whole or not at all.
pub struct FeederFunctions {
    pub configure_logging: ConfigureLoggingFn,
    pub open_stream: OpenStreamFn,
    pub open_stream_with_rtmp: OpenStreamWithRtmpFn,
    pub close_stream: CloseStreamFn,
    pub set_automatic_ips: SetAutomaticIpsFn,
    pub get_stats: GetStatsFn,
    pub version: VersionFn,
    pub send_elementary_frame: SendElementaryFrameFn,
}

struct FeederLibrary {
    _handle: *mut c_void,
    functions: FeederFunctions,
}

unsafe impl Send for FeederLibrary {}
unsafe impl Sync for FeederLibrary {}

static FEEDER_LIB: OnceLock<Option<FeederLibrary>> = OnceLock::new();

// ============================================================================
// Windows loading
// ============================================================================

#[cfg(windows)]
mod windows_loader {
    use super::*;

    #[link(name = "kernel32")]
    extern "system" {
        fn LoadLibraryW(lpLibFileName: *const u16) -> *mut c_void;
        fn GetProcAddress(hModule: *mut c_void, lpProcName: *const i8) -> *mut c_void;
    }

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn load_feeder_library() -> Option<FeederLibrary> {
        let handle = unsafe { LoadLibraryW(to_wide("zixiFeeder.dll").as_ptr()) };
        if handle.is_null() {
            return None;
        }

        unsafe {
            macro_rules! load_fn {
                ($name:expr, $ty:ty) => {{
                    let ptr = GetProcAddress(handle, concat!($name, "\0").as_ptr() as *const i8);
                    if ptr.is_null() {
                        return None;
                    }
                    std::mem::transmute::<*mut c_void, $ty>(ptr)
                }};
            }

            let functions = FeederFunctions {
                configure_logging: load_fn!("zixi_configure_logging", ConfigureLoggingFn),
                open_stream: load_fn!("zixi_open_stream", OpenStreamFn),
                open_stream_with_rtmp: load_fn!("zixi_open_stream_with_rtmp", OpenStreamWithRtmpFn),
                close_stream: load_fn!("zixi_close_stream", CloseStreamFn),
                set_automatic_ips: load_fn!("zixi_set_automatic_ips", SetAutomaticIpsFn),
                get_stats: load_fn!("zixi_get_stats", GetStatsFn),
                version: load_fn!("zixi_version", VersionFn),
                send_elementary_frame: load_fn!("zixi_send_elementary_frame", SendElementaryFrameFn),
            };

            Some(FeederLibrary {
                _handle: handle,
                functions,
            })
        }
    }
}

// ============================================================================
// Unix loading
// ============================================================================

#[cfg(not(windows))]
mod unix_loader {
    use super::*;
    use std::ffi::CString;

    const RTLD_NOW: c_int = 2;
    const RTLD_LOCAL: c_int = 0;

    extern "C" {
        fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;
        fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
        fn dlclose(handle: *mut c_void) -> c_int;
    }

    pub fn load_feeder_library() -> Option<FeederLibrary> {
        let name = CString::new("libzixiFeeder.so").ok()?;
        let handle = unsafe { dlopen(name.as_ptr(), RTLD_NOW | RTLD_LOCAL) };
        if handle.is_null() {
            return None;
        }

        unsafe {
            macro_rules! load_fn {
                ($name:expr, $ty:ty) => {{
                    let c_name = match CString::new($name) {
                        Ok(s) => s,
                        Err(_) => {
                            dlclose(handle);
                            return None;
                        }
                    };
                    let ptr = dlsym(handle, c_name.as_ptr());
                    if ptr.is_null() {
                        dlclose(handle);
                        return None;
                    }
                    std::mem::transmute::<*mut c_void, $ty>(ptr)
                }};
            }

            let functions = FeederFunctions {
                configure_logging: load_fn!("zixi_configure_logging", ConfigureLoggingFn),
                open_stream: load_fn!("zixi_open_stream", OpenStreamFn),
                open_stream_with_rtmp: load_fn!("zixi_open_stream_with_rtmp", OpenStreamWithRtmpFn),
                close_stream: load_fn!("zixi_close_stream", CloseStreamFn),
                set_automatic_ips: load_fn!("zixi_set_automatic_ips", SetAutomaticIpsFn),
                get_stats: load_fn!("zixi_get_stats", GetStatsFn),
                version: load_fn!("zixi_version", VersionFn),
                send_elementary_frame: load_fn!("zixi_send_elementary_frame", SendElementaryFrameFn),
            };

            Some(FeederLibrary {
                _handle: handle,
                functions,
            })
        }
    }
}

// ============================================================================
// Process-wide access
// ============================================================================

fn library() -> Option<&'static FeederLibrary> {
    FEEDER_LIB
        .get_or_init(|| {
            #[cfg(windows)]
            {
                windows_loader::load_feeder_library()
            }
            #[cfg(not(windows))]
            {
                unix_loader::load_feeder_library()
            }
        })
        .as_ref()
}

/// Load the feeder library, resolving the whole entry-point table.
/// Idempotent; returns whether the transport is usable.
pub fn init_feeder() -> bool {
    library().is_some()
}

/// Whether the feeder library loaded with all entry points resolved.
pub fn is_available() -> bool {
    library().is_some()
}

/// Resolved entry points, if the feeder is present.
pub fn functions() -> Option<&'static FeederFunctions> {
    library().map(|lib| &lib.functions)
}

/// Feeder version as (major, minor, minor_minor, build).
pub fn feeder_version() -> Option<(c_int, c_int, c_int, c_int)> {
    let functions = functions()?;
    let (mut major, mut minor, mut minor_minor, mut build) = (0, 0, 0, 0);
    let ret = unsafe { (functions.version)(&mut major, &mut minor, &mut minor_minor, &mut build) };
    if ret == ZIXI_ERROR_OK {
        Some((major, minor, minor_minor, build))
    } else {
        None
    }
}
