//! Send queue with the priority-aware drop policy.
//!
//! Single producer (the host's encoder thread), single consumer (the sender
//! worker). The stream holds this behind a mutex; nothing here blocks.

use std::collections::VecDeque;

use log::debug;

use crate::packet::{EncodedPacket, PacketKind};

/// Buffered duration that triggers a purge, in microseconds of DTS.
pub const DROP_THRESHOLD_USEC: i64 = 1_000_000;

/// A purge is only considered once this many packets are buffered.
const DROP_CHECK_MIN_PACKETS: usize = 5;

/// FIFO of encoded packets waiting for the sender worker.
///
/// Video packets go through a drop check on arrival: once more than a
/// second of DTS is buffered, every non-keyframe video packet is purged and
/// `min_priority` rises to the highest drop priority seen among the purged
/// frames, rejecting equally droppable arrivals until a packet clears the
/// bar again. Audio and keyframes are never dropped.
pub struct PacketQueue {
    packets: VecDeque<EncodedPacket>,
    last_dts_usec: i64,
    min_drop_dts_usec: i64,
    min_priority: i32,
    dropped_frames: u32,
    released: u64,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self {
            packets: VecDeque::new(),
            last_dts_usec: 0,
            min_drop_dts_usec: 0,
            min_priority: 0,
            dropped_frames: 0,
            released: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Frames discarded so far, by purge or by arrival rejection.
    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames
    }

    /// Packets this queue consumed without handing them to the consumer
    /// (purged, rejected, or drained). Feeds the alloc/free accounting.
    pub fn released_packets(&self) -> u64 {
        self.released
    }

    #[cfg(test)]
    pub(crate) fn min_priority(&self) -> i32 {
        self.min_priority
    }

    /// Enqueue a packet. Returns false if the drop policy rejected it, in
    /// which case the caller still owns nothing (the packet is consumed and
    /// counted).
    pub fn push(&mut self, packet: EncodedPacket) -> bool {
        match packet.kind {
            PacketKind::Audio => {
                self.append(packet);
                true
            }
            PacketKind::Video => self.push_video(packet),
        }
    }

    pub fn pop(&mut self) -> Option<EncodedPacket> {
        self.packets.pop_front()
    }

    /// Release everything still buffered; returns how many packets were
    /// freed so the caller can reconcile its alloc/free accounting.
    pub fn drain(&mut self) -> usize {
        let remaining = self.packets.len();
        if remaining > 0 {
            debug!("freeing {} remaining packets", remaining);
        }
        self.packets.clear();
        self.released += remaining as u64;
        remaining
    }

    fn append(&mut self, packet: EncodedPacket) {
        self.last_dts_usec = packet.dts_usec;
        self.packets.push_back(packet);
    }

    fn push_video(&mut self, packet: EncodedPacket) -> bool {
        self.check_drop();

        if packet.priority < self.min_priority {
            self.dropped_frames += 1;
            self.released += 1;
            false
        } else {
            self.min_priority = 0;
            self.append(packet);
            true
        }
    }

    /// Purge droppable video if the buffered DTS span crossed the
    /// threshold. Skipped right after a purge, until the head moves past
    /// the last-dropped timestamp.
    fn check_drop(&mut self) {
        if self.packets.len() < DROP_CHECK_MIN_PACKETS {
            return;
        }

        let head_dts_usec = match self.packets.front() {
            Some(first) => first.dts_usec,
            None => return,
        };

        if head_dts_usec < self.min_drop_dts_usec {
            return;
        }

        let buffer_duration_usec = self.last_dts_usec - head_dts_usec;
        if buffer_duration_usec > DROP_THRESHOLD_USEC {
            self.purge();
            debug!("dropped {} usec worth of frames", buffer_duration_usec);
        }
    }

    fn purge(&mut self) {
        debug!("packet count before purge: {}", self.packets.len());

        let mut kept = VecDeque::with_capacity(self.packets.len());
        let mut drop_priority = 0;
        let mut last_drop_dts_usec = self.min_drop_dts_usec;
        let mut num_dropped = 0u32;

        for packet in self.packets.drain(..) {
            if packet.kind == PacketKind::Audio || packet.keyframe {
                kept.push_back(packet);
            } else {
                if drop_priority < packet.drop_priority {
                    drop_priority = packet.drop_priority;
                }
                last_drop_dts_usec = packet.dts_usec;
                num_dropped += 1;
            }
        }

        self.packets = kept;
        self.min_priority = drop_priority;
        self.min_drop_dts_usec = last_drop_dts_usec;
        self.dropped_frames += num_dropped;
        self.released += num_dropped as u64;

        debug!("packet count after purge: {}", self.packets.len());
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
