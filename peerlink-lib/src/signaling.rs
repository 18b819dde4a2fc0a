pub mod loopback;

use anyhow::Result;
use async_trait::async_trait;
use derive_new::new;
use serde::{Deserialize, Serialize};

/// Opaque session description produced and consumed by the peer transport.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionDesc(pub String);

/// Opaque connectivity candidate description.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CandidateDesc(pub String);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Both endpoints compute complementary roles from the same pair of ids,
/// so no extra coordination round is needed and the two sides can never
/// both produce an offer.
pub fn determine_role(local_id: &str, remote_id: &str) -> Role {
    if local_id < remote_id {
        Role::Initiator
    } else {
        Role::Responder
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { desc: SessionDesc },
    Answer { desc: SessionDesc },
    Candidate { candidate: CandidateDesc },
}

/// One signaling message as it travels through the relay.
///
/// The relay assigns the session id when negotiation starts; until then the
/// field is empty and the first non-empty value seen is adopted.
#[derive(Clone, Debug, Deserialize, Serialize, new)]
pub struct SignalingEnvelope {
    #[serde(rename = "sessionId", default)]
    pub session_id: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Outbound half of the signaling relay collaborator.
///
/// The relay is expected to deliver envelopes between two endpoints in
/// order per endpoint pair, but not necessarily exactly once.
#[async_trait]
pub trait SignalingRelay: Send {
    async fn send(&mut self, target: &str, envelope: SignalingEnvelope) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_complementary() {
        assert_eq!(determine_role("a", "b"), Role::Initiator);
        assert_eq!(determine_role("b", "a"), Role::Responder);
    }

    #[test]
    fn envelope_serialization_shape() {
        let env = SignalingEnvelope::new(
            "s1".to_owned(),
            SignalPayload::Offer {
                desc: SessionDesc("sdp".to_owned()),
            },
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["desc"], "sdp");

        let parsed: SignalingEnvelope =
            serde_json::from_str(r#"{"type":"candidate","candidate":"c0"}"#).unwrap();
        assert!(parsed.session_id.is_empty());
        assert!(matches!(parsed.payload, SignalPayload::Candidate { .. }));
    }
}
