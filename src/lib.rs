//! zixi_output - live elementary-stream transmitter over the Zixi feeder.
//!
//! Takes encoded H.264/AAC packets from a host application, paces them
//! through a drop-policy queue, and delivers them to the dynamically
//! loaded feeder library, which handles FEC, encryption, bonding, and the
//! optional RTMP bridge on the wire. The feeder is an optional capability:
//! when its library is absent the output is simply not offered.

mod config;
mod feeder;
mod feeder_bindings;
mod output;
mod packet;
mod queue;
pub mod settings;
mod url;

pub use config::{
    build_transport_config, latency_from_id, AdaptiveMode, ConfigError, ControllerSettings,
    Encryption, EncoderParams, RtmpForward, StreamConfig, TransportConfig, ZIXI_LATENCIES_MS,
};
pub use feeder::{BitrateFeedback, SendOutcome, Transport, TransportSession, ZixiFeeder};
pub use feeder_bindings::{feeder_version, is_available, ZixiErrorCorrectionStats};
pub use output::{CreateError, StartError, StopReason, StreamOutput, ZixiStream};
pub use packet::{
    EncodedPacket, PacketKind, ADTS_HEADER_LEN, NAL_PRIORITY_DISPOSABLE, NAL_PRIORITY_HIGH,
    NAL_PRIORITY_HIGHEST, NAL_PRIORITY_LOW,
};
pub use settings::Settings;
pub use url::{UrlError, ZixiUrl};
