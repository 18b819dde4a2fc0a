//! In-process signaling router pairing sessions on the same machine.
//!
//! Stands in for the real relay in tests and examples: routes envelopes by
//! endpoint id and stamps the session id on the first offer, the way the
//! relay does once negotiation starts.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use crate::session::SessionHandle;

use super::{SignalPayload, SignalingEnvelope, SignalingRelay};

#[derive(Clone, Default)]
pub struct LoopbackRouter {
    inner: Arc<Mutex<RouterInner>>,
}

#[derive(Default)]
struct RouterInner {
    endpoints: HashMap<String, SessionHandle>,
    session_id: Option<String>,
    sent: Vec<(String, SignalingEnvelope)>,
}

impl LoopbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint_id: &str, handle: SessionHandle) {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .insert(endpoint_id.to_owned(), handle);
    }

    pub fn relay(&self) -> LoopbackRelay {
        LoopbackRelay {
            inner: self.inner.clone(),
        }
    }

    /// Every envelope routed so far, as `(target, envelope)` pairs.
    pub fn sent(&self) -> Vec<(String, SignalingEnvelope)> {
        self.inner.lock().unwrap().sent.clone()
    }
}

pub struct LoopbackRelay {
    inner: Arc<Mutex<RouterInner>>,
}

#[async_trait]
impl SignalingRelay for LoopbackRelay {
    async fn send(&mut self, target: &str, mut envelope: SignalingEnvelope) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock().unwrap();
            if envelope.session_id.is_empty() {
                if matches!(envelope.payload, SignalPayload::Offer { .. }) {
                    let assigned = inner
                        .session_id
                        .get_or_insert_with(|| Uuid::new_v4().simple().to_string());
                    envelope.session_id = assigned.clone();
                } else if let Some(assigned) = &inner.session_id {
                    envelope.session_id = assigned.clone();
                }
            }
            inner.sent.push((target.to_owned(), envelope.clone()));
            inner.endpoints.get(target).cloned()
        };
        let Some(handle) = handle else {
            bail!("unknown endpoint: {target}");
        };
        trace!(to = %target, "routing signaling envelope");
        handle.deliver_signal(envelope);
        Ok(())
    }
}
