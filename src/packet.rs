//! Encoded packet model plus the two on-wire adapters: 90 kHz timestamp
//! rebasing and ADTS framing for AAC elementary frames.

/// NAL priority ordinals used for the drop policy. Higher is more essential.
pub const NAL_PRIORITY_DISPOSABLE: i32 = 0;
pub const NAL_PRIORITY_LOW: i32 = 1;
pub const NAL_PRIORITY_HIGH: i32 = 2;
pub const NAL_PRIORITY_HIGHEST: i32 = 3;

/// Elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Video,
    Audio,
}

/// One compressed access unit handed over by the host's encoder.
///
/// Timestamps are in the encoder's timebase (`timebase_num/timebase_den`
/// seconds per tick); `dts_usec` is a monotone microsecond clock used only
/// for the queue's drop arithmetic.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
    pub pts: i64,
    pub dts: i64,
    pub timebase_num: i64,
    pub timebase_den: i64,
    pub dts_usec: i64,
    pub keyframe: bool,
    pub priority: i32,
    pub drop_priority: i32,
    pub track_idx: usize,
}

impl EncodedPacket {
    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }
}

// ============================================================================
// 90 kHz timestamp rebasing
// ============================================================================

/// Wrap base for negative video DTS (33-bit MPEG timestamp ceiling).
const PTS_WRAP_BASE: i64 = 0x1_FFFF_FFFF;

/// Rebase a non-negative timestamp to the 90 kHz domain.
pub fn to_90khz(ts: i64, num: i64, den: i64) -> u64 {
    ((ts * num * 90_000) / den) as u64
}

/// Rebase a negative DTS by wrapping it below the 33-bit ceiling.
pub fn wrap_90khz(ts: i64, num: i64, den: i64) -> u64 {
    (PTS_WRAP_BASE + (ts * 90_000 * num) / den) as u64
}

/// Timestamps for one packet in the feeder's 90 kHz domain.
///
/// Audio always uses the non-negative conversion. Video DTS may start
/// negative (B-frame reordering delay), which wraps below the 33-bit
/// ceiling instead.
pub fn rebased_timestamps(packet: &EncodedPacket) -> (u64, u64) {
    let (num, den) = (packet.timebase_num, packet.timebase_den);
    let pts = to_90khz(packet.pts, num, den);
    let dts = match packet.kind {
        PacketKind::Audio => to_90khz(packet.dts, num, den),
        PacketKind::Video if packet.dts >= 0 => to_90khz(packet.dts, num, den),
        PacketKind::Video => wrap_90khz(packet.dts, num, den),
    };
    (pts, dts)
}

// ============================================================================
// ADTS framing
// ============================================================================

/// ADTS header size prepended to every AAC frame.
pub const ADTS_HEADER_LEN: usize = 7;

/// Sampling-frequency index for the ADTS header; 0xF for rates the table
/// does not cover.
fn adts_sampling_index(sample_rate: u32) -> u8 {
    match sample_rate {
        96_000 => 0,
        88_200 => 1,
        64_000 => 2,
        48_000 => 3,
        44_100 => 4,
        32_000 => 5,
        _ => 0xF,
    }
}

/// Build the 7-byte ADTS header for one AAC-LC frame.
///
/// Sync word 0xFFF, MPEG-4, layer 0, no CRC, buffer fullness 0x7FF, single
/// raw data block. The 13-bit frame length covers the header itself.
pub fn adts_header(payload_len: usize, channels: u32, sample_rate: u32) -> [u8; ADTS_HEADER_LEN] {
    let frame_len = payload_len + ADTS_HEADER_LEN;
    let freq_index = adts_sampling_index(sample_rate);

    let mut adts = [0u8; ADTS_HEADER_LEN];
    adts[0] = 0xFF;
    adts[1] = 0xF1;
    adts[2] = (0x01u8 << 6) | (freq_index << 2) | (((channels >> 2) & 0x1) as u8);
    adts[3] = (((channels & 0x3) << 6) as u8) | (((frame_len & 0x1FFF) >> 11) as u8);
    adts[4] = ((frame_len >> 3) & 0xFF) as u8;
    adts[5] = (((frame_len & 0x7) << 5) as u8) | 0x1F;
    adts[6] = 0xFC;
    adts
}

/// Prefix an AAC payload with its ADTS header.
pub fn wrap_adts(payload: &[u8], channels: u32, sample_rate: u32) -> Vec<u8> {
    let header = adts_header(payload.len(), channels, sample_rate);
    let mut framed = Vec::with_capacity(ADTS_HEADER_LEN + payload.len());
    framed.extend_from_slice(&header);
    framed.extend_from_slice(payload);
    framed
}
