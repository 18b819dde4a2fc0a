use std::collections::VecDeque;

use anyhow::{Context, Result};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::signaling::{CandidateDesc, Role, SessionDesc, SignalPayload, SignalingEnvelope};
use crate::transport::{ChannelPurpose, PeerTransport, TransportState};

use super::{ConnectionState, Internal, SessionActor};

/// Negotiation-round state. Descriptions are set at most once per round and
/// cleared on teardown; the candidate buffer is non-empty only while the
/// remote description is unset.
pub(crate) struct NegotiationEngine {
    pub session_id: String,
    pub local_desc: Option<SessionDesc>,
    pub remote_desc: Option<SessionDesc>,
    pending: VecDeque<CandidateDesc>,
    pub answered: bool,
    pub restart_attempted: bool,
}

impl NegotiationEngine {
    pub fn new() -> Self {
        Self {
            session_id: String::new(),
            local_desc: None,
            remote_desc: None,
            pending: VecDeque::new(),
            answered: false,
            restart_attempted: false,
        }
    }

    /// The session id survives rounds; it names the pairing, not the round.
    pub fn reset_round(&mut self) {
        self.local_desc = None;
        self.remote_desc = None;
        self.pending.clear();
        self.answered = false;
        self.restart_attempted = false;
    }
}

impl SessionActor {
    pub(crate) async fn establish(&mut self) {
        match self.state() {
            ConnectionState::Negotiating | ConnectionState::Connected => {
                debug!("negotiation already in progress");
                return;
            }
            ConnectionState::Failed | ConnectionState::Disconnected => self.teardown_round().await,
            ConnectionState::Idle => {}
        }
        if let Err(e) = self.begin_negotiation().await {
            self.fail_negotiation(&e);
        }
    }

    async fn begin_negotiation(&mut self) -> Result<()> {
        self.set_state(ConnectionState::Negotiating);
        if self.role == Role::Responder {
            debug!("responder ready, awaiting remote offer");
            return Ok(());
        }
        self.new_transport().await.context("transport creation")?;
        self.attach_local_tracks().await?;
        // the channel must exist before the offer so the offer describes it
        let channel = self.transport_mut()?.create_channel("data").await?;
        self.channel.attach(channel);
        let offer = self.transport_mut()?.create_offer().await?;
        self.negotiation.local_desc = Some(offer.clone());
        self.send_negotiation_signal(SignalPayload::Offer { desc: offer })
            .await?;
        Ok(())
    }

    async fn new_transport(&mut self) -> Result<()> {
        let (transport, mut events) = self.factory.create(self.config.purpose).await?;
        self.transport = Some(transport);
        let tx = self.internal_tx.clone();
        let round = self.round;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Transport { round, event }).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn attach_local_tracks(&mut self) -> Result<()> {
        if self.config.purpose != ChannelPurpose::CallMedia {
            return Ok(());
        }
        let media = self
            .media
            .as_mut()
            .context("call session without a media source")?;
        let tracks = media.capture_tracks().await.context("media capture failed")?;
        for track in tracks {
            let id = track.id.clone();
            self.transport_mut()?
                .add_track(track)
                .await
                .with_context(|| format!("attaching track {id}"))?;
        }
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn PeerTransport>> {
        self.transport.as_mut().context("no active transport")
    }

    pub(crate) async fn on_signal(&mut self, envelope: SignalingEnvelope) {
        if self.negotiation.session_id.is_empty() && !envelope.session_id.is_empty() {
            debug!(session_id = %envelope.session_id, "session id assigned by relay");
            self.negotiation.session_id = envelope.session_id.clone();
        }
        let result = match envelope.payload {
            SignalPayload::Offer { desc } => self.on_remote_offer(desc).await,
            SignalPayload::Answer { desc } => self.on_remote_answer(desc).await,
            SignalPayload::Candidate { candidate } => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail_negotiation(&e);
        }
    }

    async fn on_remote_offer(&mut self, desc: SessionDesc) -> Result<()> {
        if self.role == Role::Initiator {
            warn!("offer from the responder side ignored");
            return Ok(());
        }
        if matches!(
            self.state(),
            ConnectionState::Failed | ConnectionState::Disconnected
        ) {
            // a failed round cannot answer a fresh offer; start clean
            self.teardown_round().await;
        }
        if self.transport.is_none() {
            self.new_transport().await.context("transport creation")?;
        } else if self.negotiation.answered {
            // the relay is not exactly-once; only a genuinely new offer
            // starts a renegotiation round
            if self.negotiation.remote_desc.as_ref().map(|d| &d.0) == Some(&desc.0) {
                debug!("duplicate offer ignored");
                return Ok(());
            }
            debug!("renegotiation offer on an established session");
            self.negotiation.local_desc = None;
            self.negotiation.remote_desc = None;
            self.negotiation.answered = false;
        }
        self.set_state(ConnectionState::Negotiating);
        self.transport_mut()?
            .set_remote_description(desc.clone())
            .await
            .context("applying remote offer")?;
        self.negotiation.remote_desc = Some(desc);
        self.drain_candidates().await;
        self.attach_local_tracks().await?;
        let answer = self.transport_mut()?.create_answer().await?;
        self.negotiation.local_desc = Some(answer.clone());
        self.negotiation.answered = true;
        self.send_negotiation_signal(SignalPayload::Answer { desc: answer })
            .await?;
        Ok(())
    }

    async fn on_remote_answer(&mut self, desc: SessionDesc) -> Result<()> {
        if self.role != Role::Initiator || self.state() != ConnectionState::Negotiating {
            warn!("unexpected answer ignored");
            return Ok(());
        }
        if self.negotiation.remote_desc.is_some() {
            debug!("duplicate answer ignored");
            return Ok(());
        }
        self.transport_mut()?
            .set_remote_description(desc.clone())
            .await
            .context("applying remote answer")?;
        self.negotiation.remote_desc = Some(desc);
        self.negotiation.answered = true;
        self.drain_candidates().await;
        Ok(())
    }

    pub(crate) async fn on_remote_candidate(&mut self, candidate: CandidateDesc) {
        if self.negotiation.remote_desc.is_some() {
            self.apply_candidate(candidate).await;
        } else {
            trace!("candidate buffered until the remote description is set");
            self.negotiation.pending.push_back(candidate);
        }
    }

    async fn apply_candidate(&mut self, candidate: CandidateDesc) {
        let Ok(transport) = self.transport_mut() else {
            warn!("candidate dropped, no active transport");
            return;
        };
        if let Err(e) = transport.add_remote_candidate(candidate).await {
            // one bad candidate must not fail connectivity
            warn!(error = %e, "failed to apply remote candidate");
        }
    }

    /// Drained exactly once, in arrival order; failures are logged per
    /// candidate and nothing is re-queued.
    async fn drain_candidates(&mut self) {
        if self.negotiation.pending.is_empty() {
            return;
        }
        debug!(
            count = self.negotiation.pending.len(),
            "draining buffered candidates"
        );
        while let Some(candidate) = self.negotiation.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
    }

    pub(crate) async fn on_transport_state(&mut self, state: TransportState) {
        debug!(?state, "transport state change");
        match state {
            TransportState::Connected => {
                if self.negotiation.local_desc.is_some() && self.negotiation.remote_desc.is_some()
                {
                    self.negotiation.restart_attempted = false;
                    self.set_state(ConnectionState::Connected);
                    self.try_start_transfer().await;
                } else {
                    warn!("transport connected before both descriptions were set");
                }
            }
            TransportState::Disconnected => {
                if self.state() == ConnectionState::Connected {
                    warn!("transport connectivity lost");
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TransportState::Failed => self.on_transport_failed().await,
            TransportState::New | TransportState::Connecting | TransportState::Closed => {}
        }
    }

    async fn on_transport_failed(&mut self) {
        let err = Error::Transport("connectivity failure reported".to_owned());
        warn!(error = %err, "transport failed");
        self.transfer.fail_active("transport failure");
        if self.role == Role::Initiator
            && !self.negotiation.restart_attempted
            && self.transport.is_some()
        {
            self.negotiation.restart_attempted = true;
            match self.try_restart().await {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "in-place restart failed"),
            }
        }
        self.enter_failed_cooldown();
    }

    async fn try_restart(&mut self) -> Result<()> {
        info!("attempting in-place connectivity restart");
        let offer = self.transport_mut()?.restart_connectivity().await?;
        self.negotiation.local_desc = Some(offer.clone());
        self.negotiation.remote_desc = None;
        self.negotiation.answered = false;
        self.set_state(ConnectionState::Negotiating);
        self.send_negotiation_signal(SignalPayload::Offer { desc: offer })
            .await?;
        Ok(())
    }

    /// Waits out the cooldown before teardown-and-retry so a flapping
    /// transport cannot drive a tight loop.
    fn enter_failed_cooldown(&mut self) {
        self.set_state(ConnectionState::Failed);
        let tx = self.internal_tx.clone();
        let round = self.round;
        let cooldown = self.config.retry_cooldown;
        info!(?cooldown, "scheduling teardown and retry");
        tokio::spawn(async move {
            sleep(cooldown).await;
            let _ = tx.send(Internal::RetryCooldown { round });
        });
    }

    pub(crate) async fn retry_after_failure(&mut self) {
        if self.state() != ConnectionState::Failed {
            trace!("cooldown expired after recovery, nothing to do");
            return;
        }
        info!("retrying after connectivity failure");
        self.teardown_round().await;
        self.set_state(ConnectionState::Idle);
        self.establish().await;
    }

    async fn send_negotiation_signal(&mut self, payload: SignalPayload) -> Result<()> {
        let envelope = SignalingEnvelope::new(self.negotiation.session_id.clone(), payload);
        self.relay
            .send(&self.config.remote_id, envelope)
            .await
            .context("signaling send failed")
    }

    pub(crate) async fn send_candidate(&mut self, candidate: CandidateDesc) {
        let envelope = SignalingEnvelope::new(
            self.negotiation.session_id.clone(),
            SignalPayload::Candidate { candidate },
        );
        if let Err(e) = self.relay.send(&self.config.remote_id, envelope).await {
            // candidate loss degrades pathfinding, it does not fail the session
            warn!(error = %e, "failed to send candidate");
        }
    }

    fn fail_negotiation(&mut self, cause: &anyhow::Error) {
        let err = Error::Negotiation(cause.to_string());
        error!(error = %err, "negotiation failed");
        self.set_state(ConnectionState::Failed);
    }
}
