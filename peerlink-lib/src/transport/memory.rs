//! Loopback transport pair for tests and examples.
//!
//! Two transports created from factories sharing one [`MemoryHub`] are
//! linked together; descriptions and candidates still travel through the
//! signaling collaborator, the hub only carries channel traffic and the
//! connectivity handshake. Candidate gathering is synthetic, and the hub
//! exposes inspection and fault-injection hooks for tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::signaling::{CandidateDesc, SessionDesc};

use super::{
    ChannelEvent, ChannelPurpose, ChannelState, DataChannel, MediaTrack, PeerTransport,
    TransportEvent, TransportEvents, TransportFactory, TransportState,
};

enum LinkMsg {
    ChannelCreate { label: String },
    Frame { binary: bool, data: Bytes },
    Drained(usize),
    Ready,
    Close,
}

enum LinkOut {
    Unlinked(Vec<LinkMsg>),
    Linked(mpsc::UnboundedSender<LinkMsg>),
    Broken,
}

/// Outgoing half of a link; buffers messages until the peer side exists.
#[derive(Clone)]
struct Link(Arc<Mutex<LinkOut>>);

impl Link {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(LinkOut::Unlinked(Vec::new()))))
    }

    fn send(&self, msg: LinkMsg) {
        let mut out = self.0.lock().unwrap();
        match &mut *out {
            LinkOut::Unlinked(buffer) => buffer.push(msg),
            LinkOut::Linked(tx) => {
                let _ = tx.send(msg);
            }
            LinkOut::Broken => trace!("dropping message on broken link"),
        }
    }

    fn link_to(&self, tx: mpsc::UnboundedSender<LinkMsg>) {
        let mut out = self.0.lock().unwrap();
        if let LinkOut::Unlinked(buffer) = &mut *out {
            for msg in buffer.drain(..) {
                let _ = tx.send(msg);
            }
        }
        *out = LinkOut::Linked(tx);
    }

    fn break_link(&self) {
        *self.0.lock().unwrap() = LinkOut::Broken;
    }
}

#[derive(Default)]
struct SideState {
    local_desc: bool,
    remote_desc: bool,
    ready_sent: bool,
    peer_ready: bool,
    connected: bool,
    channel: Option<Arc<MemoryDataChannel>>,
    applied_candidates: Vec<String>,
    tracks: Vec<MediaTrack>,
    placeholders: Vec<String>,
}

/// Connectivity handshake: a side announces readiness once both of its
/// descriptions are set, and the pair counts as connected once both sides
/// have announced.
fn try_connect(state: &mut SideState, link: &Link, events: &mpsc::UnboundedSender<TransportEvent>) {
    if state.local_desc && state.remote_desc && !state.ready_sent {
        state.ready_sent = true;
        link.send(LinkMsg::Ready);
    }
    if state.ready_sent && state.peer_ready && !state.connected {
        state.connected = true;
        let _ = events.send(TransportEvent::StateChanged(TransportState::Connected));
        if let Some(channel) = &state.channel {
            channel.set_state(ChannelState::Open);
            let _ = events.send(TransportEvent::Channel(ChannelEvent::Open));
        }
    }
}

pub struct MemoryDataChannel {
    link: Link,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<ChannelState>,
    buffered: AtomicUsize,
}

impl MemoryDataChannel {
    fn new(link: Link, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            link,
            events,
            state: Mutex::new(ChannelState::Connecting),
            buffered: AtomicUsize::new(0),
        }
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap() = state;
    }

    fn drain(&self, n: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(n))
            });
    }

    fn send_frame(&self, binary: bool, data: Bytes) -> Result<()> {
        if self.state() != ChannelState::Open {
            bail!("channel is not open");
        }
        self.buffered.fetch_add(data.len(), Ordering::Relaxed);
        self.link.send(LinkMsg::Frame { binary, data });
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.send_frame(true, payload)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(false, Bytes::copy_from_slice(text.as_bytes()))
    }

    async fn close(&self) -> Result<()> {
        self.set_state(ChannelState::Closed);
        self.link.send(LinkMsg::Close);
        let _ = self
            .events
            .send(TransportEvent::Channel(ChannelEvent::Closed));
        Ok(())
    }
}

async fn run_pump(
    mut in_rx: mpsc::UnboundedReceiver<LinkMsg>,
    state: Arc<Mutex<SideState>>,
    link: Link,
    events: mpsc::UnboundedSender<TransportEvent>,
    hub: Arc<Mutex<HubInner>>,
    endpoint: String,
) {
    while let Some(msg) = in_rx.recv().await {
        match msg {
            LinkMsg::Ready => {
                let mut state = state.lock().unwrap();
                state.peer_ready = true;
                try_connect(&mut state, &link, &events);
            }
            LinkMsg::ChannelCreate { label } => {
                trace!(%endpoint, %label, "remote channel arrived");
                let channel = Arc::new(MemoryDataChannel::new(link.clone(), events.clone()));
                let connected = {
                    let mut state = state.lock().unwrap();
                    state.channel = Some(channel.clone());
                    state.connected
                };
                let _ = events.send(TransportEvent::ChannelOpened(channel.clone()));
                if connected {
                    channel.set_state(ChannelState::Open);
                    let _ = events.send(TransportEvent::Channel(ChannelEvent::Open));
                }
            }
            LinkMsg::Frame { binary, data } => {
                link.send(LinkMsg::Drained(data.len()));
                if binary {
                    hub.lock()
                        .unwrap()
                        .frames
                        .push((endpoint.clone(), data.clone()));
                    let _ = events.send(TransportEvent::Channel(ChannelEvent::Binary(data)));
                } else {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    let _ = events.send(TransportEvent::Channel(ChannelEvent::Text(text)));
                }
            }
            LinkMsg::Drained(n) => {
                let channel = state.lock().unwrap().channel.clone();
                if let Some(channel) = channel {
                    channel.drain(n);
                }
            }
            LinkMsg::Close => {
                let channel = state.lock().unwrap().channel.clone();
                if let Some(channel) = channel {
                    channel.set_state(ChannelState::Closed);
                }
                let _ = events.send(TransportEvent::Channel(ChannelEvent::Closed));
            }
        }
    }
}

pub struct MemoryTransport {
    endpoint: String,
    state: Arc<Mutex<SideState>>,
    link: Link,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    fn gather_candidates(&self) {
        for seq in 0..2 {
            let desc = CandidateDesc(format!("cand:{}:{}", self.endpoint, seq));
            let _ = self.events.send(TransportEvent::CandidateGathered(desc));
        }
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_channel(&mut self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = Arc::new(MemoryDataChannel::new(self.link.clone(), self.events.clone()));
        {
            let mut state = self.state.lock().unwrap();
            if state.channel.is_some() {
                bail!("channel already created");
            }
            state.channel = Some(channel.clone());
        }
        self.link.send(LinkMsg::ChannelCreate {
            label: label.to_owned(),
        });
        Ok(channel)
    }

    async fn create_offer(&mut self) -> Result<SessionDesc> {
        self.state.lock().unwrap().local_desc = true;
        self.gather_candidates();
        Ok(SessionDesc(format!("offer:{}", self.endpoint)))
    }

    async fn create_answer(&mut self) -> Result<SessionDesc> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.remote_desc {
                bail!("cannot answer before the remote description is set");
            }
            state.local_desc = true;
            try_connect(&mut state, &self.link, &self.events);
        }
        self.gather_candidates();
        Ok(SessionDesc(format!("answer:{}", self.endpoint)))
    }

    async fn set_remote_description(&mut self, desc: SessionDesc) -> Result<()> {
        if desc.0.contains("malformed") {
            bail!("malformed session description");
        }
        let mut state = self.state.lock().unwrap();
        state.remote_desc = true;
        try_connect(&mut state, &self.link, &self.events);
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: CandidateDesc) -> Result<()> {
        if candidate.0.contains("invalid") {
            bail!("unusable candidate: {}", candidate.0);
        }
        self.state
            .lock()
            .unwrap()
            .applied_candidates
            .push(candidate.0);
        Ok(())
    }

    async fn add_track(&mut self, track: MediaTrack) -> Result<()> {
        self.state.lock().unwrap().tracks.push(track);
        Ok(())
    }

    async fn substitute_placeholder(&mut self, track_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.tracks.iter().any(|t| t.id == track_id) {
            bail!("unknown track: {track_id}");
        }
        state.placeholders.push(track_id.to_owned());
        Ok(())
    }

    async fn restart_connectivity(&mut self) -> Result<SessionDesc> {
        bail!("in-place connectivity restart is not supported by the loopback transport");
    }

    async fn close(&mut self) -> Result<()> {
        debug!(endpoint = %self.endpoint, "closing loopback transport");
        let channel = self.state.lock().unwrap().channel.clone();
        if let Some(channel) = channel {
            channel.set_state(ChannelState::Closed);
        }
        self.link.send(LinkMsg::Close);
        let _ = self
            .events
            .send(TransportEvent::StateChanged(TransportState::Closed));
        Ok(())
    }
}

struct PendingLink {
    in_tx: mpsc::UnboundedSender<LinkMsg>,
    link: Link,
}

struct SideCtl {
    endpoint: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Arc<Mutex<SideState>>,
    link: Link,
}

#[derive(Default)]
struct HubInner {
    waiting: Option<PendingLink>,
    sides: Vec<SideCtl>,
    frames: Vec<(String, Bytes)>,
}

/// Pairs transports two at a time, in creation order, and keeps handles to
/// every side for inspection and fault injection.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self, endpoint: &str) -> MemoryTransportFactory {
        MemoryTransportFactory {
            hub: self.clone(),
            endpoint: endpoint.to_owned(),
        }
    }

    fn with_side<T>(&self, endpoint: &str, f: impl FnOnce(&SideCtl) -> T) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .sides
            .iter()
            .rev()
            .find(|side| side.endpoint == endpoint)
            .map(f)
    }

    /// Candidates applied to the newest transport of `endpoint`, in order.
    pub fn applied_candidates(&self, endpoint: &str) -> Vec<String> {
        self.with_side(endpoint, |side| {
            side.state.lock().unwrap().applied_candidates.clone()
        })
        .unwrap_or_default()
    }

    pub fn attached_tracks(&self, endpoint: &str) -> Vec<String> {
        self.with_side(endpoint, |side| {
            let state = side.state.lock().unwrap();
            state.tracks.iter().map(|t| t.id.clone()).collect()
        })
        .unwrap_or_default()
    }

    pub fn placeholder_substitutions(&self, endpoint: &str) -> Vec<String> {
        self.with_side(endpoint, |side| {
            side.state.lock().unwrap().placeholders.clone()
        })
        .unwrap_or_default()
    }

    /// Binary frames in delivery order, tagged with the receiving endpoint.
    pub fn binary_frames(&self) -> Vec<(String, Bytes)> {
        self.inner.lock().unwrap().frames.clone()
    }

    /// Break every link and report hard connectivity failure to all sides.
    pub fn fail_transports(&self) {
        let inner = self.inner.lock().unwrap();
        for side in &inner.sides {
            side.link.break_link();
            let _ = side
                .events
                .send(TransportEvent::StateChanged(TransportState::Failed));
        }
    }

    /// Deliver a "track ended" signal to the newest transport of `endpoint`.
    pub fn end_track(&self, endpoint: &str, track_id: &str) {
        let _ = self.with_side(endpoint, |side| {
            let _ = side
                .events
                .send(TransportEvent::TrackEnded(track_id.to_owned()));
        });
    }
}

pub struct MemoryTransportFactory {
    hub: MemoryHub,
    endpoint: String,
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &mut self,
        _purpose: ChannelPurpose,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents)> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = Link::new();
        let state = Arc::new(Mutex::new(SideState::default()));

        {
            let mut inner = self.hub.inner.lock().unwrap();
            match inner.waiting.take() {
                None => {
                    inner.waiting = Some(PendingLink {
                        in_tx: in_tx.clone(),
                        link: link.clone(),
                    });
                }
                Some(pending) => {
                    pending.link.link_to(in_tx.clone());
                    link.link_to(pending.in_tx);
                }
            }
            inner.sides.push(SideCtl {
                endpoint: self.endpoint.clone(),
                events: events_tx.clone(),
                state: state.clone(),
                link: link.clone(),
            });
        }

        tokio::spawn(run_pump(
            in_rx,
            state.clone(),
            link.clone(),
            events_tx.clone(),
            self.hub.inner.clone(),
            self.endpoint.clone(),
        ));

        let transport = MemoryTransport {
            endpoint: self.endpoint.clone(),
            state,
            link,
            events: events_tx,
        };
        Ok((Box::new(transport), events_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_matching<T>(
        events: &mut TransportEvents,
        mut pick: impl FnMut(&TransportEvent) -> Option<T>,
    ) -> T {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("event stream closed");
                if let Some(value) = pick(&event) {
                    return value;
                }
            }
        })
        .await
        .expect("timed out waiting for transport event")
    }

    #[tokio::test]
    async fn loopback_pair_connects_and_passes_frames() {
        let hub = MemoryHub::new();
        let (mut a, mut a_events) = hub
            .factory("a")
            .create(ChannelPurpose::FileTransfer)
            .await
            .unwrap();
        let (mut b, mut b_events) = hub
            .factory("b")
            .create(ChannelPurpose::FileTransfer)
            .await
            .unwrap();

        let channel = a.create_channel("data").await.unwrap();
        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        next_matching(&mut a_events, |event| {
            matches!(
                event,
                TransportEvent::StateChanged(TransportState::Connected)
            )
            .then_some(())
        })
        .await;
        next_matching(&mut a_events, |event| {
            matches!(event, TransportEvent::Channel(ChannelEvent::Open)).then_some(())
        })
        .await;

        channel.send(Bytes::from_static(b"ping")).await.unwrap();
        let frame = next_matching(&mut b_events, |event| match event {
            TransportEvent::Channel(ChannelEvent::Binary(data)) => Some(data.clone()),
            _ => None,
        })
        .await;
        assert_eq!(&frame[..], b"ping");
        assert_eq!(hub.binary_frames().len(), 1);
    }

    #[tokio::test]
    async fn sends_fail_before_the_channel_opens() {
        let hub = MemoryHub::new();
        let (mut a, _a_events) = hub
            .factory("a")
            .create(ChannelPurpose::FileTransfer)
            .await
            .unwrap();
        let channel = a.create_channel("data").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connecting);
        assert!(channel.send(Bytes::from_static(b"early")).await.is_err());
    }
}
