use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{HuddleError, HuddleResult};
use crate::media::{CaptureConstraints, CaptureDevices, CaptureSource};
use crate::types::TrackKind;

#[derive(Debug)]
pub struct SimCaptureSource {
    device_id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SimCaptureSource {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl CaptureSource for SimCaptureSource {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Capture devices with one microphone, one camera and one screen by default.
pub struct SimCaptureDevices {
    devices: Mutex<HashMap<TrackKind, Vec<String>>>,
    denied: Mutex<HashSet<TrackKind>>,
    opened: Mutex<Vec<Arc<SimCaptureSource>>>,
}

impl Default for SimCaptureDevices {
    fn default() -> Self {
        let devices = HashMap::from([
            (TrackKind::Audio, vec!["mic-0".to_string()]),
            (TrackKind::Video, vec!["cam-0".to_string()]),
            (TrackKind::Screen, vec!["screen-0".to_string()]),
        ]);
        Self {
            devices: Mutex::new(devices),
            denied: Mutex::new(HashSet::new()),
            opened: Mutex::new(Vec::new()),
        }
    }
}

impl SimCaptureDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, kind: TrackKind, device_id: impl Into<String>) {
        self.devices
            .lock()
            .entry(kind)
            .or_default()
            .push(device_id.into());
    }

    pub fn unplug(&self, kind: TrackKind) {
        self.devices.lock().remove(&kind);
    }

    pub fn deny(&self, kind: TrackKind) {
        self.denied.lock().insert(kind);
    }

    /// Every source opened so far, in open order.
    pub fn opened(&self) -> Vec<Arc<SimCaptureSource>> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl CaptureDevices for SimCaptureDevices {
    async fn open(
        &self,
        kind: TrackKind,
        constraints: &CaptureConstraints,
    ) -> HuddleResult<Arc<dyn CaptureSource>> {
        if self.denied.lock().contains(&kind) {
            return Err(HuddleError::PermissionDenied { kind });
        }
        let device_id = {
            let devices = self.devices.lock();
            let available = devices.get(&kind).map(Vec::as_slice).unwrap_or_default();
            match &constraints.device_id {
                Some(wanted) => available.iter().find(|id| *id == wanted).cloned(),
                None => available.first().cloned(),
            }
        }
        .ok_or(HuddleError::DeviceUnavailable { kind })?;

        let source = Arc::new(SimCaptureSource {
            device_id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        });
        self.opened.lock().push(source.clone());
        Ok(source as Arc<dyn CaptureSource>)
    }
}
