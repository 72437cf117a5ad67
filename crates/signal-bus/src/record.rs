use std::fmt;

use serde::{Deserialize, Serialize};

use crate::RelayError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    End,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::End => "end",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the JSON shape browsers produce: `{"type", "sdp"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, mline_index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(mline_index);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Empty,
}

/// One exchanged signaling message. Immutable once sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingRecord {
    pub from: PeerId,
    pub to: PeerId,
    pub kind: SignalKind,
    pub payload: SignalPayload,
}

impl SignalingRecord {
    pub fn offer(from: PeerId, to: PeerId, description: SessionDescription) -> Self {
        Self {
            from,
            to,
            kind: SignalKind::Offer,
            payload: SignalPayload::Description(description),
        }
    }

    pub fn answer(from: PeerId, to: PeerId, description: SessionDescription) -> Self {
        Self {
            from,
            to,
            kind: SignalKind::Answer,
            payload: SignalPayload::Description(description),
        }
    }

    pub fn candidate(from: PeerId, to: PeerId, candidate: IceCandidate) -> Self {
        Self {
            from,
            to,
            kind: SignalKind::Candidate,
            payload: SignalPayload::Candidate(candidate),
        }
    }

    pub fn end(from: PeerId, to: PeerId) -> Self {
        Self {
            from,
            to,
            kind: SignalKind::End,
            payload: SignalPayload::Empty,
        }
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        match &self.payload {
            SignalPayload::Description(description) => Some(description),
            _ => None,
        }
    }

    pub fn ice_candidate(&self) -> Option<&IceCandidate> {
        match &self.payload {
            SignalPayload::Candidate(candidate) => Some(candidate),
            _ => None,
        }
    }
}

/// Row as stored by the relay. `signal_data` is itself a JSON document
/// `{ "sdp"?, "candidate"? }`, and `"{}"` for `end`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRow {
    pub caller_id: String,
    pub receiver_id: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub signal_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_mode: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignalData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl RelayRow {
    pub fn from_record(record: &SignalingRecord, call_mode: Option<&str>) -> Result<Self, RelayError> {
        let data = match &record.payload {
            SignalPayload::Description(description) => SignalData {
                sdp: Some(description.clone()),
                candidate: None,
            },
            SignalPayload::Candidate(candidate) => SignalData {
                sdp: None,
                candidate: Some(candidate.clone()),
            },
            SignalPayload::Empty => SignalData::default(),
        };
        Ok(Self {
            caller_id: record.from.to_string(),
            receiver_id: record.to.to_string(),
            kind: record.kind,
            signal_data: serde_json::to_string(&data)?,
            call_mode: call_mode.map(str::to_string),
        })
    }

    pub fn into_record(self) -> Result<SignalingRecord, RelayError> {
        let data: SignalData = if self.signal_data.trim().is_empty() {
            SignalData::default()
        } else {
            serde_json::from_str(&self.signal_data)
                .map_err(|err| RelayError::Malformed(format!("signal_data: {err}")))?
        };
        let from = PeerId::new(self.caller_id);
        let to = PeerId::new(self.receiver_id);
        let payload = match self.kind {
            SignalKind::Offer | SignalKind::Answer => data
                .sdp
                .map(SignalPayload::Description)
                .ok_or_else(|| RelayError::Malformed(format!("{} without sdp", self.kind)))?,
            SignalKind::Candidate => data
                .candidate
                .map(SignalPayload::Candidate)
                .ok_or_else(|| RelayError::Malformed("candidate without candidate".into()))?,
            SignalKind::End => SignalPayload::Empty,
        };
        Ok(SignalingRecord {
            from,
            to,
            kind: self.kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_row_uses_browser_field_names() {
        let record = SignalingRecord::candidate(
            "alice".into(),
            "bob".into(),
            IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host")
                .with_mid("0", 0),
        );
        let row = RelayRow::from_record(&record, Some("watchparty")).expect("row");
        assert_eq!(row.kind, SignalKind::Candidate);
        assert_eq!(row.call_mode.as_deref(), Some("watchparty"));
        let data: serde_json::Value = serde_json::from_str(&row.signal_data).expect("json");
        assert_eq!(data["candidate"]["sdpMid"], json!("0"));
        assert_eq!(data["candidate"]["sdpMLineIndex"], json!(0));
        assert!(data.get("sdp").is_none());
    }

    #[test]
    fn end_row_carries_empty_signal_data() {
        let record = SignalingRecord::end("alice".into(), "bob".into());
        let row = RelayRow::from_record(&record, None).expect("row");
        assert_eq!(row.signal_data, "{}");
        let value = serde_json::to_value(&row).expect("value");
        assert_eq!(value["type"], json!("end"));
        assert!(value.get("call_mode").is_none());
    }

    #[test]
    fn browser_answer_row_decodes() {
        let row: RelayRow = serde_json::from_value(json!({
            "caller_id": "bob",
            "receiver_id": "alice",
            "type": "answer",
            "signal_data": "{\"sdp\":{\"type\":\"answer\",\"sdp\":\"v=0\\r\\n\"}}",
            "call_mode": "watchparty"
        }))
        .expect("row");
        let record = row.into_record().expect("record");
        assert_eq!(record.kind, SignalKind::Answer);
        assert_eq!(record.from, PeerId::new("bob"));
        assert_eq!(
            record.description(),
            Some(&SessionDescription::answer("v=0\r\n"))
        );
    }

    #[test]
    fn null_optional_candidate_fields_are_accepted() {
        let row = RelayRow {
            caller_id: "bob".into(),
            receiver_id: "alice".into(),
            kind: SignalKind::Candidate,
            signal_data: r#"{"candidate":{"candidate":"candidate:2","sdpMid":null,"sdpMLineIndex":null,"usernameFragment":null}}"#.into(),
            call_mode: None,
        };
        let record = row.into_record().expect("record");
        assert_eq!(record.ice_candidate(), Some(&IceCandidate::new("candidate:2")));
    }

    #[test]
    fn answer_without_sdp_is_malformed() {
        let row = RelayRow {
            caller_id: "bob".into(),
            receiver_id: "alice".into(),
            kind: SignalKind::Answer,
            signal_data: "{}".into(),
            call_mode: None,
        };
        assert!(matches!(row.into_record(), Err(RelayError::Malformed(_))));
    }
}
