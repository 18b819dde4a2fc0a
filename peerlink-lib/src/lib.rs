pub mod error;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use crate::error::Error;
pub use crate::session::{ConnectionState, Session, SessionConfig, SessionEvents, SessionHandle};
pub use crate::signaling::{
    determine_role, CandidateDesc, Role, SessionDesc, SignalPayload, SignalingEnvelope,
    SignalingRelay,
};
pub use crate::transfer::{
    FileMetadata, ReceivedFile, TransferDirection, TransferProgress, TransferStatus,
};
pub use crate::transport::{ChannelPurpose, MediaSource, MediaTrack, TrackKind};
