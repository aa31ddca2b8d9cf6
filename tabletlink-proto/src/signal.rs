use serde::{Deserialize, Deserializer, Serialize};

use crate::slot::HOST_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Client -> Relay: "I am <id>"; forwarded to the host for device ids
    LoginNotify,
    /// Host -> Device: session description offer
    Offer,
    /// Device -> Host: session description answer
    Answer,
    /// Either direction: one connectivity candidate
    Candidate,
}

/// The single message type carried over the relay.
///
/// Every field except `type` is optional on the wire. Older clients emit
/// every field and use `""` for the ones they leave unset, so empty strings
/// are read back as absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Stamped by the relay; whatever a sender puts here is overwritten.
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none", skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
    #[serde(
        rename = "sdpMid",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// A connectivity candidate as exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

impl SignalingEnvelope {
    fn bare(kind: SignalKind) -> Self {
        Self {
            kind,
            id: None,
            from: None,
            target: None,
            sdp: None,
            candidate: None,
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn login(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::bare(SignalKind::LoginNotify)
        }
    }

    pub fn offer(target: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            sdp: Some(sdp.into()),
            ..Self::bare(SignalKind::Offer)
        }
    }

    /// Device -> host answer; `id` names the answering slot.
    pub fn answer(id: impl Into<String>, sdp: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            target: Some(HOST_ID.to_string()),
            sdp: Some(sdp.into()),
            ..Self::bare(SignalKind::Answer)
        }
    }

    pub fn candidate(target: impl Into<String>, id: Option<String>, candidate: IceCandidate) -> Self {
        Self {
            id,
            target: Some(target.into()),
            candidate: Some(candidate.candidate),
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Self::bare(SignalKind::Candidate)
        }
    }

    /// The identity this envelope came from: the relay stamp, or the
    /// self-declared `id` when the relay had nothing to stamp.
    pub fn sender(&self) -> Option<&str> {
        self.from.as_deref().or(self.id.as_deref())
    }

    pub fn ice_candidate(&self) -> Option<IceCandidate> {
        let candidate = self.candidate.clone()?;
        Some(IceCandidate {
            candidate,
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        })
    }
}
