//! Closed-loop encoder bitrate control.
//!
//! The feeder calls back on one of its own threads with the bandwidth it
//! currently sustains; the controller clamps that hint, pushes it to the
//! video encoder, and derives a decimation factor the raw-frame source can
//! use to pre-drop input proportionally.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::feeder::BitrateFeedback;

use super::stream::{StreamFlags, StreamOutput};

struct DecimationState {
    factor: f32,
    total_raw_frames: u64,
    sent_to_encoder_frames: u64,
}

/// Per-session feedback state shared between the feeder callback thread,
/// the workers, and the telemetry getters.
///
/// Only this controller's own mutex and atomics are touched on the
/// callback path; the queue lock is never taken here.
pub struct FeedbackController {
    video_bitrate: AtomicU32,
    last_sent_bps: AtomicU32,
    safe_to_event: AtomicBool,
    can_send: AtomicBool,
    decimation: Mutex<DecimationState>,
    output: Arc<dyn StreamOutput>,
    flags: Arc<StreamFlags>,
}

impl FeedbackController {
    pub(crate) fn new(output: Arc<dyn StreamOutput>, flags: Arc<StreamFlags>) -> Self {
        Self {
            video_bitrate: AtomicU32::new(0),
            last_sent_bps: AtomicU32::new(0),
            safe_to_event: AtomicBool::new(false),
            can_send: AtomicBool::new(false),
            decimation: Mutex::new(DecimationState {
                factor: 1.0,
                total_raw_frames: 0,
                sent_to_encoder_frames: 0,
            }),
            output,
            flags,
        }
    }

    /// Reset per-session state before a new connect.
    pub(crate) fn reset(&self) {
        self.last_sent_bps.store(0, Ordering::Release);
        self.safe_to_event.store(false, Ordering::Release);
        self.can_send.store(false, Ordering::Release);
        let mut state = self.decimation.lock();
        state.factor = 1.0;
        state.total_raw_frames = 0;
        state.sent_to_encoder_frames = 0;
    }

    /// Enable callback processing for a session with the given nominal
    /// video bitrate.
    pub(crate) fn arm(&self, video_bitrate: u32) {
        self.video_bitrate.store(video_bitrate, Ordering::Release);
        self.last_sent_bps.store(0, Ordering::Release);
        self.safe_to_event.store(true, Ordering::Release);
    }

    /// Gate for late callbacks; cleared on stop so the controller becomes
    /// a no-op before the worker joins.
    pub(crate) fn allow_callbacks(&self, allow: bool) {
        self.can_send.store(allow, Ordering::Release);
    }

    /// Called when a send fails; suppresses any further encoder pokes.
    pub(crate) fn mark_unsafe(&self) {
        self.safe_to_event.store(false, Ordering::Release);
    }

    /// Last bitrate pushed to the encoder, in bps.
    pub fn last_sent_bps(&self) -> u32 {
        self.last_sent_bps.load(Ordering::Acquire)
    }

    /// Fraction of raw frames the source should keep, in (0, 1].
    pub fn decimation_factor(&self) -> f32 {
        self.decimation.lock().factor
    }
}

impl BitrateFeedback for FeedbackController {
    fn on_transport_feedback(&self, total_bps: u32, _force_iframe: bool) {
        if self.last_sent_bps.load(Ordering::Acquire) == total_bps
            || self.flags.disconnected()
            || self.flags.connecting()
            || !self.flags.active()
            || !self.can_send.load(Ordering::Acquire)
            || !self.safe_to_event.load(Ordering::Acquire)
        {
            return;
        }

        let video_bitrate = self.video_bitrate.load(Ordering::Acquire);
        let floor = video_bitrate / 2;

        let to_encoder = if total_bps <= floor {
            debug!(
                "encoder feedback requested {} bps, clamping to {} bps",
                total_bps, floor
            );
            floor
        } else {
            debug!("encoder feedback {} bps", total_bps);
            total_bps
        };

        if self.last_sent_bps.load(Ordering::Acquire) != to_encoder {
            self.last_sent_bps.store(to_encoder, Ordering::Release);
            self.output.set_video_bitrate(to_encoder / 1000);
        }

        let mut state = self.decimation.lock();
        let mut factor = 1.0f32;
        if floor > 0 && total_bps <= floor {
            factor = total_bps as f32 / floor as f32;
        }
        if factor != state.factor {
            debug!("decimation factor {:.02}", factor);
            state.factor = factor;
            state.total_raw_frames = 0;
            state.sent_to_encoder_frames = 0;
        }
    }
}
