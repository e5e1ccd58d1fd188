use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{HuddleError, HuddleResult};

const MAX_SESSION_ID_LEN: usize = 512;

/// Opaque identifier of an endpoint, as verified by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub display_name: String,
}

impl Endpoint {
    pub fn new(id: impl Into<EndpointId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// URL-safe session identifier shared by both sides of a link or by every
/// member of a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(raw: impl Into<String>) -> HuddleResult<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN || !raw.bytes().all(is_unreserved) {
            return Err(HuddleError::InvalidSessionId(raw));
        }
        Ok(Self(raw))
    }

    /// Session id of the link between `initiator` and `responder` inside the
    /// mesh `mesh`. `incarnation` identifies the initiator's current join so a
    /// rejoin never reuses slots left over from an earlier link.
    ///
    /// Every component is escaped so `~` only ever separates them. When the
    /// readable form would not fit a session id, its name-based uuid is used
    /// instead; both sides derive the same value either way.
    pub fn for_pair(
        mesh: &SessionId,
        incarnation: &str,
        initiator: &EndpointId,
        responder: &EndpointId,
    ) -> Self {
        let readable = format!(
            "{}~{}~{}~{}",
            escape_component(mesh.as_str()),
            escape_component(incarnation),
            escape_component(initiator.as_str()),
            escape_component(responder.as_str()),
        );
        if readable.len() <= MAX_SESSION_ID_LEN {
            return Self(readable);
        }
        Self(format!(
            "pair-{}",
            Uuid::new_v5(&Uuid::NAMESPACE_URL, readable.as_bytes())
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Invite link of the form `{base}/session/{id}`.
    pub fn invite_url(&self, base: &Url) -> HuddleResult<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| HuddleError::InvalidState(format!("{base} cannot carry a path")))?
            .pop_if_empty()
            .push("session")
            .push(&self.0);
        Ok(url)
    }

    /// Extracts the session id from an invite link produced by `invite_url`.
    pub fn from_invite_url(url: &Url) -> HuddleResult<Self> {
        let mut segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        match (segments.pop(), segments.pop()) {
            (Some(id), Some("session")) => Self::parse(id),
            _ => Err(HuddleError::InvalidSessionId(url.to_string())),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = HuddleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'~' | b'-')
}

// `~` separates components, so it is escaped along with `_` (the escape
// marker) and every byte outside the unreserved set.
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if is_unreserved(b) && b != b'_' && b != b'~' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{b:02x}"));
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Slot this role publishes its own candidates to.
    pub fn candidate_slot(self) -> Slot {
        match self {
            Role::Initiator => Slot::CandidateA,
            Role::Responder => Slot::CandidateB,
        }
    }

    /// Slot this role reads the remote side's candidates from.
    pub fn remote_candidate_slot(self) -> Slot {
        self.peer().candidate_slot()
    }

    /// Slot this role reads the remote description from.
    pub fn remote_description_slot(self) -> Slot {
        match self {
            Role::Initiator => Slot::Answer,
            Role::Responder => Slot::Offer,
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Offer,
    Answer,
    CandidateA,
    CandidateB,
}

impl Slot {
    pub fn is_candidate(self) -> bool {
        matches!(self, Slot::CandidateA | Slot::CandidateB)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::Offer => "offer",
            Slot::Answer => "answer",
            Slot::CandidateA => "candidate_a",
            Slot::CandidateB => "candidate_b",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
    Screen,
}

impl TrackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
            TrackKind::Screen => "screen",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_reject_reserved_characters() {
        assert!(SessionId::parse("abc-DEF_1.2~3").is_ok());
        assert_eq!(
            SessionId::parse("a/b"),
            Err(HuddleError::InvalidSessionId("a/b".into()))
        );
        assert!(SessionId::parse("").is_err());
        assert!(SessionId::parse("with space").is_err());
    }

    #[test]
    fn generated_session_ids_are_url_safe() {
        let id = SessionId::generate();
        assert!(SessionId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn pair_ids_escape_every_component() {
        let mesh = SessionId::parse("room").unwrap();
        let id = SessionId::for_pair(
            &mesh,
            "inc",
            &EndpointId::from("alice@example.com"),
            &EndpointId::from("b~ob"),
        );
        assert_eq!(id.as_str(), "room~inc~alice_40example.com~b_7eob");
        assert!(SessionId::parse(id.as_str()).is_ok());

        let swapped = SessionId::for_pair(
            &mesh,
            "inc",
            &EndpointId::from("b~ob"),
            &EndpointId::from("alice@example.com"),
        );
        assert_ne!(id, swapped);

        // A separator inside the mesh id cannot shift the other components.
        let tilde_mesh = SessionId::parse("a~b").unwrap();
        let first = SessionId::for_pair(&tilde_mesh, "c", &"d".into(), &"e".into());
        let plain = SessionId::parse("a").unwrap();
        let second = SessionId::for_pair(&plain, "b~c", &"d".into(), &"e".into());
        assert_eq!(first.as_str(), "a_7eb~c~d~e");
        assert_ne!(first, second);
    }

    #[test]
    fn long_pair_ids_stay_valid_session_ids() {
        let mesh = SessionId::parse("m".repeat(480)).unwrap();
        let alice = EndpointId::from("alice@example.com");
        let bob = EndpointId::from("bob@example.com");
        let id = SessionId::for_pair(&mesh, "inc", &alice, &bob);
        assert!(id.as_str().starts_with("pair-"));

        let json = serde_json::to_string(&id).unwrap();
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert_eq!(SessionId::for_pair(&mesh, "inc", &alice, &bob), id);
        assert_ne!(SessionId::for_pair(&mesh, "inc", &bob, &alice), id);
    }

    #[test]
    fn invite_urls_round_trip() {
        let base = Url::parse("https://huddle.example/").unwrap();
        let id = SessionId::parse("4f1c-room").unwrap();
        let url = id.invite_url(&base).unwrap();
        assert_eq!(url.as_str(), "https://huddle.example/session/4f1c-room");
        assert_eq!(SessionId::from_invite_url(&url).unwrap(), id);
    }

    #[test]
    fn roles_use_opposite_candidate_slots() {
        assert_eq!(Role::Initiator.candidate_slot(), Slot::CandidateA);
        assert_eq!(Role::Responder.candidate_slot(), Slot::CandidateB);
        assert_eq!(Role::Initiator.remote_candidate_slot(), Slot::CandidateB);
        assert_eq!(Role::Responder.remote_description_slot(), Slot::Offer);
    }
}
