//! Capture sources and their binding to peer links.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{HuddleError, HuddleResult};
use crate::link::PeerLink;
use crate::types::{SessionId, TrackId, TrackKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub sample_rate: Option<u32>,
}

impl CaptureConstraints {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }
}

/// An open capture device producing one stream of media.
pub trait CaptureSource: Send + Sync + fmt::Debug {
    fn device_id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    /// Releases the device. Further frames are not produced.
    fn stop(&self);
}

#[async_trait]
pub trait CaptureDevices: Send + Sync {
    /// Opens a source of `kind`. Fails with `PermissionDenied` when the user
    /// refused access and `DeviceUnavailable` when no device matches.
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &CaptureConstraints,
    ) -> HuddleResult<Arc<dyn CaptureSource>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackBinding {
    pub id: TrackId,
    pub kind: TrackKind,
    pub source_device_id: String,
    pub enabled: bool,
}

/// What a transport needs to send a track.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub binding: TrackBinding,
    pub source: Arc<dyn CaptureSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOutcome {
    /// The sender switched sources without a new offer.
    InPlace,
    /// The sender was recreated and the link renegotiated.
    Renegotiated,
}

struct TrackEntry {
    binding: TrackBinding,
    source: Arc<dyn CaptureSource>,
    links: Vec<PeerLink>,
}

impl TrackEntry {
    fn local(&self) -> LocalTrack {
        LocalTrack {
            binding: self.binding.clone(),
            source: self.source.clone(),
        }
    }

    fn prune(&mut self) {
        self.links.retain(|link| !link.is_closed());
    }
}

/// Owns every local track. Links only hold a sender for it.
pub struct MediaTrackController {
    devices: Arc<dyn CaptureDevices>,
    tracks: Mutex<HashMap<TrackId, TrackEntry>>,
}

impl MediaTrackController {
    pub fn new(devices: Arc<dyn CaptureDevices>) -> Self {
        Self {
            devices,
            tracks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(
        &self,
        kind: TrackKind,
        constraints: &CaptureConstraints,
    ) -> HuddleResult<TrackBinding> {
        let source = self.devices.open(kind, constraints).await.map_err(|err| {
            warn!(target = "huddle::media", kind = %kind, error = %err, "capture open failed");
            err
        })?;
        let binding = TrackBinding {
            id: TrackId::generate(),
            kind,
            source_device_id: source.device_id().to_string(),
            enabled: true,
        };
        info!(
            target = "huddle::media",
            track = %binding.id,
            kind = %kind,
            device = %binding.source_device_id,
            "track acquired"
        );
        self.tracks.lock().insert(
            binding.id.clone(),
            TrackEntry {
                binding: binding.clone(),
                source,
                links: Vec::new(),
            },
        );
        Ok(binding)
    }

    pub fn binding(&self, track_id: &TrackId) -> Option<TrackBinding> {
        self.tracks
            .lock()
            .get(track_id)
            .map(|entry| entry.binding.clone())
    }

    pub fn bindings(&self) -> Vec<TrackBinding> {
        self.tracks
            .lock()
            .values()
            .map(|entry| entry.binding.clone())
            .collect()
    }

    /// Sessions of the live links currently sending `track_id`.
    pub fn bound_links(&self, track_id: &TrackId) -> Vec<SessionId> {
        let mut tracks = self.tracks.lock();
        let Some(entry) = tracks.get_mut(track_id) else {
            return Vec::new();
        };
        entry.prune();
        entry
            .links
            .iter()
            .map(|link| link.session_id().clone())
            .collect()
    }

    /// Adds a sender for the track to `link`. A connected link renegotiates.
    pub async fn bind(&self, track_id: &TrackId, link: &PeerLink) -> HuddleResult<()> {
        let local = {
            let mut tracks = self.tracks.lock();
            let entry = tracks.get_mut(track_id).ok_or_else(|| unknown_track(track_id))?;
            entry.prune();
            if entry
                .links
                .iter()
                .any(|bound| bound.session_id() == link.session_id())
            {
                return Ok(());
            }
            entry.local()
        };
        link.add_track(local).await?;

        let released = {
            let mut tracks = self.tracks.lock();
            match tracks.get_mut(track_id) {
                Some(entry) => {
                    entry.links.push(link.clone());
                    false
                }
                None => true,
            }
        };
        if released {
            // Released while the sender was being added.
            let _ = link.remove_track(track_id).await;
            return Err(unknown_track(track_id));
        }
        debug!(
            target = "huddle::media",
            track = %track_id,
            session_id = %link.session_id(),
            "track bound"
        );
        Ok(())
    }

    /// Opens a new source for the track and swaps it into every bound link.
    pub async fn replace(
        &self,
        track_id: &TrackId,
        constraints: &CaptureConstraints,
    ) -> HuddleResult<ReplaceOutcome> {
        let kind = self
            .binding(track_id)
            .ok_or_else(|| unknown_track(track_id))?
            .kind;
        let source = self.devices.open(kind, constraints).await?;
        self.replace_source(track_id, source).await
    }

    /// Swaps `source` in for the track's current source. The track keeps its
    /// id; the old source is stopped.
    pub async fn replace_source(
        &self,
        track_id: &TrackId,
        source: Arc<dyn CaptureSource>,
    ) -> HuddleResult<ReplaceOutcome> {
        let (local, previous, links) = {
            let mut tracks = self.tracks.lock();
            let entry = tracks.get_mut(track_id).ok_or_else(|| unknown_track(track_id))?;
            if source.kind() != entry.binding.kind {
                return Err(HuddleError::invalid_state(format!(
                    "cannot replace {} track with a {} source",
                    entry.binding.kind,
                    source.kind()
                )));
            }
            entry.prune();
            source.set_enabled(entry.binding.enabled);
            let previous = std::mem::replace(&mut entry.source, source);
            entry.binding.source_device_id = entry.source.device_id().to_string();
            (entry.local(), previous, entry.links.clone())
        };

        let mut outcome = ReplaceOutcome::InPlace;
        for link in &links {
            match link.replace_track(local.clone()).await {
                Ok(ReplaceOutcome::Renegotiated) => outcome = ReplaceOutcome::Renegotiated,
                Ok(ReplaceOutcome::InPlace) => {}
                Err(HuddleError::Closed(_)) => {}
                Err(err) => return Err(err),
            }
        }
        previous.stop();
        info!(
            target = "huddle::media",
            track = %track_id,
            device = %local.binding.source_device_id,
            outcome = ?outcome,
            links = links.len(),
            "track source replaced"
        );
        Ok(outcome)
    }

    /// Mutes or unmutes the source. No renegotiation.
    pub fn set_enabled(&self, track_id: &TrackId, enabled: bool) -> HuddleResult<()> {
        let mut tracks = self.tracks.lock();
        let entry = tracks.get_mut(track_id).ok_or_else(|| unknown_track(track_id))?;
        entry.source.set_enabled(enabled);
        entry.binding.enabled = enabled;
        Ok(())
    }

    /// Detaches the track from one link, leaving the source running.
    pub async fn unbind(&self, track_id: &TrackId, link: &PeerLink) -> HuddleResult<()> {
        let bound = {
            let mut tracks = self.tracks.lock();
            let entry = tracks.get_mut(track_id).ok_or_else(|| unknown_track(track_id))?;
            let before = entry.links.len();
            entry
                .links
                .retain(|bound| bound.session_id() != link.session_id());
            entry.links.len() != before
        };
        if bound {
            match link.remove_track(track_id).await {
                Ok(()) | Err(HuddleError::Closed(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Stops the source and removes the track from every link.
    pub async fn release(&self, track_id: &TrackId) -> HuddleResult<()> {
        let entry = self
            .tracks
            .lock()
            .remove(track_id)
            .ok_or_else(|| unknown_track(track_id))?;
        entry.source.stop();
        for link in &entry.links {
            if let Err(err) = link.remove_track(track_id).await {
                debug!(
                    target = "huddle::media",
                    track = %track_id,
                    session_id = %link.session_id(),
                    error = %err,
                    "sender already gone"
                );
            }
        }
        info!(target = "huddle::media", track = %track_id, "track released");
        Ok(())
    }
}

fn unknown_track(track_id: &TrackId) -> HuddleError {
    HuddleError::invalid_state(format!("unknown track {track_id}"))
}
