pub(crate) mod channel;
mod negotiation;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::signaling::{determine_role, Role, SignalingEnvelope, SignalingRelay};
use crate::transfer::codec;
use crate::transfer::engine::{PumpEvent, TransferEngine};
use crate::transfer::{FileMetadata, ReceivedFile, TransferProgress};
use crate::transport::{
    ChannelEvent, ChannelPurpose, MediaSource, PeerTransport, TransportEvent, TransportFactory,
};

use self::channel::TransferChannel;
use self::negotiation::NegotiationEngine;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_BUFFER_HIGH_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_DRAIN_POLL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub local_id: String,
    pub remote_id: String,
    pub purpose: ChannelPurpose,
    pub chunk_size: usize,
    pub buffer_high_watermark: usize,
    pub drain_poll: Duration,
    pub max_file_size: u64,
    pub retry_cooldown: Duration,
}

impl SessionConfig {
    pub fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        purpose: ChannelPurpose,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            purpose,
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer_high_watermark: DEFAULT_BUFFER_HIGH_WATERMARK,
            drain_poll: DEFAULT_DRAIN_POLL,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            retry_cooldown: DEFAULT_RETRY_COOLDOWN,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

enum Command {
    Establish,
    Signal(SignalingEnvelope),
    QueueFile {
        path: PathBuf,
        metadata: FileMetadata,
        reply: oneshot::Sender<bool>,
    },
    Cleanup,
}

pub(crate) enum Internal {
    Transport { round: u64, event: TransportEvent },
    Pump { round: u64, event: PumpEvent },
    RetryCooldown { round: u64 },
}

/// Read-only streams out of the session: progress records and fully
/// reassembled incoming files. Both are fire-and-forget; ordering across
/// different files is not guaranteed.
pub struct SessionEvents {
    pub progress: mpsc::UnboundedReceiver<TransferProgress>,
    pub received: mpsc::UnboundedReceiver<ReceivedFile>,
}

pub struct Session;

impl Session {
    /// Spawn one session actor for the `local_id`/`remote_id` pairing.
    ///
    /// Every state transition of the session runs on the spawned task, one
    /// event at a time; the handle and the event streams are the only way
    /// in and out. Dropping the last handle, or `cleanup`, stops the actor
    /// and releases the transport on the way out.
    pub fn spawn(
        config: SessionConfig,
        relay: Box<dyn SignalingRelay>,
        factory: Box<dyn TransportFactory>,
        media: Option<Box<dyn MediaSource>>,
    ) -> (SessionHandle, SessionEvents) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let role = determine_role(&config.local_id, &config.remote_id);
        info!(local = %config.local_id, remote = %config.remote_id, ?role, "session spawned");
        let actor = SessionActor {
            role,
            relay,
            factory,
            media,
            state_tx,
            round: 0,
            negotiation: NegotiationEngine::new(),
            transport: None,
            channel: TransferChannel::new(),
            transfer: TransferEngine::new(progress_tx, received_tx),
            command_rx,
            internal_tx,
            internal_rx,
            config,
        };
        tokio::spawn(actor.run());
        (
            SessionHandle {
                command_tx,
                state_rx,
            },
            SessionEvents {
                progress: progress_rx,
                received: received_rx,
            },
        )
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    pub fn establish_connection(&self) {
        let _ = self.command_tx.send(Command::Establish);
    }

    /// Inbound path from the signaling relay client.
    pub fn deliver_signal(&self, envelope: SignalingEnvelope) {
        let _ = self.command_tx.send(Command::Signal(envelope));
    }

    /// Queue a file for sending. `Ok(false)` only on size-limit rejection;
    /// queueing triggers negotiation if none is in progress.
    pub async fn queue_file(
        &self,
        path: impl Into<PathBuf>,
        metadata: FileMetadata,
    ) -> Result<bool> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::QueueFile {
                path: path.into(),
                metadata,
                reply: reply_tx,
            })
            .map_err(|_| anyhow!("session terminated"))?;
        reply_rx.await.context("session terminated")
    }

    /// Deterministic resource release; pending sends are cancelled and the
    /// transport is closed on the way out.
    pub fn cleanup(&self) {
        let _ = self.command_tx.send(Command::Cleanup);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

struct SessionActor {
    config: SessionConfig,
    role: Role,
    relay: Box<dyn SignalingRelay>,
    factory: Box<dyn TransportFactory>,
    media: Option<Box<dyn MediaSource>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every teardown; events, timers, and pump completions from
    /// earlier rounds are dropped on arrival.
    round: u64,
    negotiation: NegotiationEngine,
    transport: Option<Box<dyn PeerTransport>>,
    channel: TransferChannel,
    transfer: TransferEngine,
    command_rx: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let exit = match command {
                        Some(command) => self.handle_command(command).await,
                        None => true,
                    };
                    if exit {
                        break;
                    }
                }
                Some(event) = self.internal_rx.recv() => self.handle_internal(event).await,
            }
        }
        self.teardown_round().await;
        self.set_state(ConnectionState::Idle);
        debug!("session actor stopped");
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Establish => self.establish().await,
            Command::Signal(envelope) => self.on_signal(envelope).await,
            Command::QueueFile {
                path,
                metadata,
                reply,
            } => {
                let accepted = self
                    .transfer
                    .queue_file(path, metadata, self.config.max_file_size);
                let _ = reply.send(accepted);
                if accepted {
                    match self.state() {
                        ConnectionState::Idle
                        | ConnectionState::Failed
                        | ConnectionState::Disconnected => {
                            // queueing triggers negotiation; the state check
                            // keeps a running negotiation from being duplicated
                            self.establish().await;
                        }
                        ConnectionState::Connected => self.try_start_transfer().await,
                        ConnectionState::Negotiating => {}
                    }
                }
            }
            Command::Cleanup => return true,
        }
        false
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Transport { round, event } => {
                if round != self.round {
                    trace!("stale transport event dropped");
                    return;
                }
                self.on_transport_event(event).await;
            }
            Internal::Pump { round, event } => {
                if round != self.round {
                    trace!("stale pump event dropped");
                    return;
                }
                if self.transfer.on_pump_event(event) {
                    self.try_start_transfer().await;
                }
            }
            Internal::RetryCooldown { round } => {
                if round != self.round {
                    trace!("stale cooldown dropped");
                    return;
                }
                self.retry_after_failure().await;
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::CandidateGathered(candidate) => self.send_candidate(candidate).await,
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
            TransportEvent::ChannelOpened(channel) => self.channel.attach(channel),
            TransportEvent::Channel(event) => self.on_channel_event(event).await,
            TransportEvent::TrackEnded(track_id) => self.on_track_ended(track_id).await,
        }
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                self.channel.mark_open();
                self.try_start_transfer().await;
            }
            ChannelEvent::Binary(frame) => match codec::decode_chunk(&frame) {
                Ok((file_id, payload)) => {
                    let payload = frame.slice_ref(payload);
                    let file_id = file_id.to_owned();
                    self.transfer.on_chunk(&file_id, payload);
                }
                // the offending frame is dropped, the session continues
                Err(e) => warn!(error = %e, "dropping malformed chunk frame"),
            },
            ChannelEvent::Text(text) => match codec::decode_control(&text) {
                Ok(msg) => self.transfer.on_control(msg),
                Err(e) => warn!(error = %e, "dropping malformed control frame"),
            },
            ChannelEvent::Closed => {
                debug!("data channel closed");
                self.channel.reset();
            }
            ChannelEvent::Error(message) => warn!(%message, "data channel error"),
        }
    }

    async fn on_track_ended(&mut self, track_id: String) {
        info!(%track_id, "track ended, substituting placeholder");
        match self.transport.as_mut() {
            Some(transport) => {
                if let Err(e) = transport.substitute_placeholder(&track_id).await {
                    warn!(error = %e, %track_id, "placeholder substitution failed");
                }
            }
            None => warn!(%track_id, "track ended with no active transport"),
        }
    }

    async fn try_start_transfer(&mut self) {
        self.transfer
            .start_next(&self.channel, &self.config, self.round, &self.internal_tx)
            .await;
    }

    async fn teardown_round(&mut self) {
        self.round += 1;
        self.transfer.abort_all();
        self.channel.reset();
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(error = %e, "transport close");
            }
        }
        self.negotiation.reset_round();
    }

    fn set_state(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() != state {
            info!(?state, "connection state");
            let _ = self.state_tx.send(state);
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::time::timeout;

    use crate::signaling::loopback::LoopbackRouter;
    use crate::signaling::{CandidateDesc, SignalPayload};
    use crate::transfer::TransferStatus;
    use crate::transport::memory::MemoryHub;
    use crate::transport::{MediaTrack, TrackKind};

    struct StaticTracks(Vec<MediaTrack>);

    #[async_trait]
    impl MediaSource for StaticTracks {
        async fn capture_tracks(&mut self) -> Result<Vec<MediaTrack>> {
            Ok(self.0.clone())
        }
    }

    struct Peer {
        handle: SessionHandle,
        events: SessionEvents,
    }

    fn test_config(local: &str, remote: &str, purpose: ChannelPurpose) -> SessionConfig {
        let mut config = SessionConfig::new(local, remote, purpose);
        config.chunk_size = 1024;
        config.buffer_high_watermark = 2048;
        config.drain_poll = Duration::from_millis(1);
        config.retry_cooldown = Duration::from_millis(50);
        config
    }

    fn spawn_pair(
        hub: &MemoryHub,
        router: &LoopbackRouter,
        purpose: ChannelPurpose,
        with_media: bool,
    ) -> (Peer, Peer) {
        let mut peers = Vec::new();
        for (local, remote) in [("a", "b"), ("b", "a")] {
            let media: Option<Box<dyn MediaSource>> = if with_media {
                Some(Box::new(StaticTracks(vec![
                    MediaTrack::new(format!("{local}-cam"), TrackKind::Video),
                    MediaTrack::new(format!("{local}-mic"), TrackKind::Audio),
                ])))
            } else {
                None
            };
            let (handle, events) = Session::spawn(
                test_config(local, remote, purpose),
                Box::new(router.relay()),
                Box::new(hub.factory(local)),
                media,
            );
            router.register(local, handle.clone());
            peers.push(Peer { handle, events });
        }
        let b = peers.pop().unwrap();
        let a = peers.pop().unwrap();
        (a, b)
    }

    async fn wait_state(handle: &SessionHandle, target: ConnectionState) {
        let mut rx = handle.state_changes();
        timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow_and_update() == target {
                    return;
                }
                rx.changed().await.expect("session gone");
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"));
    }

    async fn next_progress(events: &mut SessionEvents) -> TransferProgress {
        timeout(Duration::from_secs(5), events.progress.recv())
            .await
            .expect("timed out waiting for progress")
            .expect("progress stream closed")
    }

    async fn wait_terminal(events: &mut SessionEvents, file_id: &str) -> TransferStatus {
        loop {
            let progress = next_progress(events).await;
            if progress.file_id() == file_id
                && matches!(
                    progress.status(),
                    TransferStatus::Completed | TransferStatus::Failed
                )
            {
                return progress.status();
            }
        }
    }

    fn write_fixture(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn concurrent_establish_produces_exactly_one_offer() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;
        wait_state(&b.handle, ConnectionState::Connected).await;

        let sent = router.sent();
        let offers: Vec<_> = sent
            .iter()
            .filter(|(_, env)| matches!(env.payload, SignalPayload::Offer { .. }))
            .collect();
        // "a" < "b", so only "a" may create the offer
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].0, "b");
        assert!(!offers[0].1.session_id.is_empty());
        let answers = sent
            .iter()
            .filter(|(_, env)| matches!(env.payload, SignalPayload::Answer { .. }))
            .count();
        assert_eq!(answers, 1);
    }

    #[tokio::test]
    async fn early_candidates_drain_in_arrival_order() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);

        // candidates reach "b" before any offer exists; one of them is bad
        for candidate in ["early:0", "early invalid", "early:1"] {
            b.handle.deliver_signal(SignalingEnvelope::new(
                String::new(),
                SignalPayload::Candidate {
                    candidate: CandidateDesc(candidate.to_owned()),
                },
            ));
        }

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;
        wait_state(&b.handle, ConnectionState::Connected).await;

        let applied = hub.applied_candidates("b");
        // drained once, in arrival order; the bad candidate is skipped and
        // never re-queued; trickled candidates from "a" follow the drain
        assert_eq!(&applied[..2], &["early:0".to_owned(), "early:1".to_owned()]);
        assert!(applied[2..].iter().all(|c| c.starts_with("cand:a:")));
    }

    #[tokio::test]
    async fn file_round_trip_is_byte_exact() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, mut b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let path = write_fixture(&dir, "payload.bin", &data);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;

        let metadata =
            FileMetadata::new("payload.bin", data.len() as u64, "application/octet-stream");
        assert!(a.handle.queue_file(&path, metadata).await.unwrap());

        let received = timeout(Duration::from_secs(5), b.events.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.data.len(), data.len());
        assert_eq!(&received.data[..], &data[..]);
        assert_eq!(received.metadata.name, "payload.bin");

        // sender progress is monotonic and ends complete at the exact size
        let mut a_events = a.events;
        let mut last = 0;
        loop {
            let progress = next_progress(&mut a_events).await;
            assert!(progress.transferred() >= last);
            last = progress.transferred();
            if progress.status() == TransferStatus::Completed {
                assert_eq!(progress.transferred(), data.len() as u64);
                assert_eq!(progress.percent(), 100);
                break;
            }
        }
    }

    #[tokio::test]
    async fn queue_file_triggers_negotiation_once() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, mut b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);
        let dir = tempfile::tempdir().unwrap();
        let first = write_fixture(&dir, "first.bin", &[1u8; 3000]);
        let second = write_fixture(&dir, "second.bin", &[2u8; 2000]);

        // queueing with no session in progress starts one; the second queue
        // call lands mid-negotiation and must not start another
        assert!(a
            .handle
            .queue_file(&first, FileMetadata::new("first.bin", 3000, ""))
            .await
            .unwrap());
        assert!(a
            .handle
            .queue_file(&second, FileMetadata::new("second.bin", 2000, ""))
            .await
            .unwrap());
        b.handle.establish_connection();

        let one = timeout(Duration::from_secs(5), b.events.received.recv())
            .await
            .unwrap()
            .unwrap();
        let two = timeout(Duration::from_secs(5), b.events.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(one.metadata.name, "first.bin");
        assert_eq!(two.metadata.name, "second.bin");

        let offers = router
            .sent()
            .iter()
            .filter(|(_, env)| matches!(env.payload, SignalPayload::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn oversized_queue_file_is_rejected_without_side_effects() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, _b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);

        let metadata = FileMetadata::new("huge.bin", DEFAULT_MAX_FILE_SIZE + 1, "");
        let accepted = a.handle.queue_file("huge.bin", metadata).await.unwrap();
        assert!(!accepted);
        // no record, no negotiation
        let mut a_events = a.events;
        assert!(a_events.progress.try_recv().is_err());
        assert_eq!(a.handle.connection_state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn sequential_files_never_interleave_chunk_frames() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, mut b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);
        let dir = tempfile::tempdir().unwrap();
        let first = write_fixture(&dir, "one.bin", &[3u8; 5000]);
        let second = write_fixture(&dir, "two.bin", &[4u8; 3000]);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;

        assert!(a
            .handle
            .queue_file(&first, FileMetadata::new("one.bin", 5000, ""))
            .await
            .unwrap());
        assert!(a
            .handle
            .queue_file(&second, FileMetadata::new("two.bin", 3000, ""))
            .await
            .unwrap());

        for _ in 0..2 {
            timeout(Duration::from_secs(5), b.events.received.recv())
                .await
                .unwrap()
                .unwrap();
        }

        let ids: Vec<String> = hub
            .binary_frames()
            .iter()
            .filter(|(endpoint, _)| endpoint == "b")
            .map(|(_, frame)| codec::decode_chunk(frame).unwrap().0.to_owned())
            .collect();
        assert!(!ids.is_empty());
        // once the tag changes it never goes back: strictly two runs
        let mut runs = Vec::new();
        for id in ids {
            if runs.last() != Some(&id) {
                assert!(!runs.contains(&id), "chunk frames interleaved");
                runs.push(id);
            }
        }
        assert_eq!(runs.len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_fails_the_transfer_and_recovers() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, mut b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);
        let dir = tempfile::tempdir().unwrap();
        let big = write_fixture(&dir, "big.bin", &[5u8; 64 * 1024]);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;

        assert!(a
            .handle
            .queue_file(&big, FileMetadata::new("big.bin", 64 * 1024, ""))
            .await
            .unwrap());

        // wait until the transfer is underway, then kill connectivity
        let mut a_events = a.events;
        let file_id = loop {
            let progress = next_progress(&mut a_events).await;
            if progress.status() == TransferStatus::Transferring {
                break progress.file_id().to_owned();
            }
        };
        hub.fail_transports();

        assert_eq!(
            wait_terminal(&mut a_events, &file_id).await,
            TransferStatus::Failed
        );

        // after the cooldown both sides tear down and renegotiate a fresh
        // round without reusing the dead channel
        wait_state(&a.handle, ConnectionState::Connected).await;
        wait_state(&b.handle, ConnectionState::Connected).await;

        let small = write_fixture(&dir, "after.bin", &[6u8; 512]);
        assert!(a
            .handle
            .queue_file(&small, FileMetadata::new("after.bin", 512, ""))
            .await
            .unwrap());
        let received = timeout(Duration::from_secs(5), b.events.received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.metadata.name, "after.bin");
    }

    #[tokio::test]
    async fn call_sessions_attach_tracks_and_substitute_placeholders() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, b) = spawn_pair(&hub, &router, ChannelPurpose::CallMedia, true);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;
        wait_state(&b.handle, ConnectionState::Connected).await;

        assert_eq!(hub.attached_tracks("a"), vec!["a-cam", "a-mic"]);
        assert_eq!(hub.attached_tracks("b"), vec!["b-cam", "b-mic"]);

        // user revokes the screen/camera share: placeholder, not a dangling track
        hub.end_track("a", "a-cam");
        timeout(Duration::from_secs(5), async {
            loop {
                if hub.placeholder_substitutions("a") == vec!["a-cam".to_owned()] {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cleanup_releases_resources_and_stops_the_actor() {
        let hub = MemoryHub::new();
        let router = LoopbackRouter::new();
        let (a, b) = spawn_pair(&hub, &router, ChannelPurpose::FileTransfer, false);

        a.handle.establish_connection();
        b.handle.establish_connection();
        wait_state(&a.handle, ConnectionState::Connected).await;

        a.handle.cleanup();
        wait_state(&a.handle, ConnectionState::Idle).await;
        let result = a
            .handle
            .queue_file("x.bin", FileMetadata::new("x.bin", 1, ""))
            .await;
        assert!(result.is_err());
    }
}
