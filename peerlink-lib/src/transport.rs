pub mod memory;
pub mod webrtc;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use derive_new::new;
use tokio::sync::mpsc;

use crate::signaling::{CandidateDesc, SessionDesc};

/// What a negotiated channel is for. One negotiation engine serves both;
/// call sessions additionally attach captured media tracks before the
/// offer or answer is created.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelPurpose {
    FileTransfer,
    CallMedia,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Descriptor of one locally captured track. The capture collaborator owns
/// the actual media; the core only routes the descriptor to the transport.
#[derive(Clone, Debug, new)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Media/display-capture collaborator: an ordered collection of locally
/// captured tracks, obtainable on demand.
#[async_trait]
pub trait MediaSource: Send {
    async fn capture_tracks(&mut self) -> Result<Vec<MediaTrack>>;
}

pub enum TransportEvent {
    CandidateGathered(CandidateDesc),
    StateChanged(TransportState),
    /// A remotely created channel arrived; its reference shows up
    /// asynchronously, independent of the answer being sent.
    ChannelOpened(Arc<dyn DataChannel>),
    Channel(ChannelEvent),
    /// The collaborator-observed "track ended" signal, e.g. the user
    /// revoked a screen share.
    TrackEnded(String),
}

#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Open,
    Binary(Bytes),
    Text(String),
    Closed,
    Error(String),
}

/// Record-oriented channel over the established transport. Delivery is
/// ordered per channel instance; its lifecycle events arrive on the owning
/// transport's event stream.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn state(&self) -> ChannelState;
    async fn buffered_amount(&self) -> usize;
    async fn send(&self, payload: Bytes) -> Result<()>;
    async fn send_text(&self, text: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// The underlying peer transport for one negotiation round. Connectivity
/// internals (gathering, pathfinding) stay behind this seam; the core only
/// moves opaque descriptions in and out.
#[async_trait]
pub trait PeerTransport: Send {
    async fn create_channel(&mut self, label: &str) -> Result<Arc<dyn DataChannel>>;
    async fn create_offer(&mut self) -> Result<SessionDesc>;
    async fn create_answer(&mut self) -> Result<SessionDesc>;
    async fn set_remote_description(&mut self, desc: SessionDesc) -> Result<()>;
    async fn add_remote_candidate(&mut self, candidate: CandidateDesc) -> Result<()>;
    async fn add_track(&mut self, track: MediaTrack) -> Result<()>;
    async fn substitute_placeholder(&mut self, track_id: &str) -> Result<()>;
    async fn restart_connectivity(&mut self) -> Result<SessionDesc>;
    async fn close(&mut self) -> Result<()>;
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A closed transport is never reused; each negotiation round gets a fresh
/// one from the factory.
#[async_trait]
pub trait TransportFactory: Send {
    async fn create(
        &mut self,
        purpose: ChannelPurpose,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents)>;
}
