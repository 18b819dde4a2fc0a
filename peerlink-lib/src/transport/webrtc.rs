//! WebRTC-backed transport.
//!
//! Candidates trickle: the offer is emitted as soon as the local
//! description is set and every gathered candidate goes out through the
//! signaling collaborator as its own opaque blob. Descriptions travel as
//! serialized session descriptions, candidates as serialized candidate
//! init structures.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use webrtc::{
    api::setting_engine::SettingEngine,
    data_channel::{
        data_channel_init::RTCDataChannelInit, data_channel_state::RTCDataChannelState,
        RTCDataChannel,
    },
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

use crate::signaling::{CandidateDesc, SessionDesc};

use super::{
    ChannelEvent, ChannelPurpose, ChannelState, DataChannel, MediaTrack, PeerTransport,
    TransportEvent, TransportEvents, TransportFactory, TransportState,
};

const PROTOCOL: &str = "PEERLINK/1";

pub struct WebRtcTransportFactory {
    ice_servers: Vec<String>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

impl Default for WebRtcTransportFactory {
    fn default() -> Self {
        Self::new(vec!["stun:stun.l.google.com:19302".to_owned()])
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &mut self,
        purpose: ChannelPurpose,
    ) -> Result<(Box<dyn PeerTransport>, TransportEvents)> {
        if purpose == ChannelPurpose::CallMedia {
            bail!("call media requires a track-capable transport");
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = WebRtcTransport::new(self.ice_servers.clone(), events_tx).await?;
        Ok((Box::new(transport), events_rx))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

pub struct WebRtcTransport {
    rtc: Option<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    async fn new(
        ice_servers: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(None, Some(Duration::from_secs(30)), None);
        let rtc = webrtc::api::APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build()
            .new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: ice_servers,
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await?;

        let tx = events.clone();
        rtc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::StateChanged(map_state(state)));
            })
        }));

        let tx = events.clone();
        rtc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!("candidate gathering complete");
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_string(&init)) {
                    Ok(Ok(json)) => {
                        let _ = tx.send(TransportEvent::CandidateGathered(CandidateDesc(json)));
                    }
                    Ok(Err(e)) => warn!(error = %e, "failed to serialize local candidate"),
                    Err(e) => warn!(error = %e, "failed to convert local candidate"),
                }
            })
        }));

        let tx = events.clone();
        rtc.on_data_channel(Box::new(move |rtc_channel| {
            let tx = tx.clone();
            Box::pin(async move {
                let channel = WebRtcDataChannel::register(rtc_channel, tx.clone());
                let _ = tx.send(TransportEvent::ChannelOpened(channel));
            })
        }));

        Ok(Self {
            rtc: Some(rtc),
            events,
        })
    }

    fn rtc(&self) -> Result<&RTCPeerConnection> {
        self.rtc.as_ref().context("transport closed")
    }

    async fn local_description(&self) -> Result<SessionDesc> {
        let desc = self
            .rtc()?
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description"))?;
        Ok(SessionDesc(serde_json::to_string(&desc)?))
    }
}

impl Drop for WebRtcTransport {
    fn drop(&mut self) {
        // an established connection does not go away on drop; close it
        if let Some(rtc) = self.rtc.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    let _ = rtc.close().await;
                });
            }
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_channel(&mut self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let rtc_channel = self
            .rtc()?
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    protocol: Some(PROTOCOL.to_owned()),
                    ..Default::default()
                }),
            )
            .await?;
        Ok(WebRtcDataChannel::register(
            rtc_channel,
            self.events.clone(),
        ))
    }

    async fn create_offer(&mut self) -> Result<SessionDesc> {
        let offer = self.rtc()?.create_offer(None).await?;
        self.rtc()?.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn create_answer(&mut self) -> Result<SessionDesc> {
        let answer = self.rtc()?.create_answer(None).await?;
        self.rtc()?.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_description(&mut self, desc: SessionDesc) -> Result<()> {
        let desc: RTCSessionDescription =
            serde_json::from_str(&desc.0).context("malformed session description")?;
        self.rtc()?.set_remote_description(desc).await?;
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: CandidateDesc) -> Result<()> {
        let init: RTCIceCandidateInit =
            serde_json::from_str(&candidate.0).context("malformed candidate")?;
        self.rtc()?.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_track(&mut self, track: MediaTrack) -> Result<()> {
        // no track-local plumbing here; a call-capable embedding supplies
        // its own transport implementation
        bail!("media track {} not supported by this transport", track.id);
    }

    async fn substitute_placeholder(&mut self, track_id: &str) -> Result<()> {
        bail!("media track {track_id} not supported by this transport");
    }

    async fn restart_connectivity(&mut self) -> Result<SessionDesc> {
        let offer = self.rtc()?.create_offer(None).await?;
        self.rtc()?.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(rtc) = self.rtc.take() {
            rtc.close().await?;
        }
        Ok(())
    }
}

struct WebRtcDataChannel {
    rtc: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    /// Wire the channel callbacks into the transport event stream and wrap
    /// the handle. Locally created and remotely received channels converge
    /// on the same dispatch behavior here.
    fn register(
        rtc: Arc<RTCDataChannel>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn DataChannel> {
        let tx = events.clone();
        rtc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Channel(ChannelEvent::Open));
            })
        }));

        let tx = events.clone();
        rtc.on_message(Box::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = if msg.is_string {
                    ChannelEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelEvent::Binary(msg.data)
                };
                let _ = tx.send(TransportEvent::Channel(event));
            })
        }));

        let tx = events.clone();
        rtc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Channel(ChannelEvent::Closed));
            })
        }));

        let tx = events;
        rtc.on_error(Box::new(move |err| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::Channel(ChannelEvent::Error(
                    err.to_string(),
                )));
            })
        }));

        Arc::new(Self { rtc })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn state(&self) -> ChannelState {
        match self.rtc.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.rtc.buffered_amount().await
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        self.rtc.send(&payload).await?;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.rtc.send_text(text.to_owned()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.rtc.close().await?)
    }
}
