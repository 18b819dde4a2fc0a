use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Error;
use crate::transfer::codec::{self, ControlMessage};
use crate::transport::{ChannelState, DataChannel};

/// The session's data channel, whichever way it came into existence: the
/// initiator creates it before the offer, the responder receives it from
/// the transport once the remote side's channel arrives. Sends are gated on
/// the open transition; a closed channel is never reused.
pub(crate) struct TransferChannel {
    channel: Option<Arc<dyn DataChannel>>,
    ready: bool,
}

impl TransferChannel {
    pub fn new() -> Self {
        Self {
            channel: None,
            ready: false,
        }
    }

    pub fn attach(&mut self, channel: Arc<dyn DataChannel>) {
        if self.channel.is_some() {
            warn!("replacing an existing channel reference");
        }
        self.ready = false;
        self.channel = Some(channel);
    }

    pub fn mark_open(&mut self) {
        if self.channel.is_none() {
            warn!("open transition without a channel");
            return;
        }
        debug!("data channel open");
        self.ready = true;
    }

    pub fn reset(&mut self) {
        self.channel = None;
        self.ready = false;
    }

    pub fn is_ready(&self) -> bool {
        matches!(&self.channel, Some(c) if self.ready && c.state() == ChannelState::Open)
    }

    pub fn handle(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.clone()
    }

    pub async fn send_control(&self, msg: &ControlMessage) -> Result<(), Error> {
        let Some(channel) = self.channel.as_ref().filter(|_| self.is_ready()) else {
            return Err(Error::ChannelNotReady);
        };
        let text = codec::encode_control(msg)?;
        channel
            .send_text(&text)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}
