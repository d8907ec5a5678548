//! Adapter Controller
//!
//! Locates the one adapter object among the daemon's mirrored objects and
//! sees it through to the powered-on state. Only single-adapter operation is
//! supported; when several adapters exist the configured name wins, or the
//! first one in snapshot order when no name is configured.

use crate::domain::events::RemoteObject;
use crate::domain::iface;
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

/// Reference to the adapter object found in the daemon's object tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterHandle {
    pub path: OwnedObjectPath,
    /// Mirror of the remote `Powered` property; changes asynchronously.
    pub powered: bool,
}

/// What the controller wants done next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSignal {
    /// Issue an async `Powered = true` request and watch the property.
    PowerOn(OwnedObjectPath),
    /// The adapter is powered on.
    Ready,
}

pub struct AdapterController {
    /// Adapter name to select, e.g. "hci0". `None` takes the first found.
    preferred: Option<String>,
    handle: Option<AdapterHandle>,
    power_on_requested: bool,
    ready_signaled: bool,
}

impl AdapterController {
    pub fn new(preferred: Option<String>) -> Self {
        Self {
            preferred,
            handle: None,
            power_on_requested: false,
            ready_signaled: false,
        }
    }

    pub fn handle(&self) -> Option<&AdapterHandle> {
        self.handle.as_ref()
    }

    /// Drop the adapter reference. Called when the daemon vanishes; any
    /// previously cached handle is invalid from here on.
    pub fn reset(&mut self) {
        self.handle = None;
        self.power_on_requested = false;
        self.ready_signaled = false;
    }

    fn matches_preference(&self, path: &OwnedObjectPath) -> bool {
        match &self.preferred {
            None => true,
            Some(name) => path.as_str().rsplit('/').next() == Some(name.as_str()),
        }
    }

    /// Consider one mirrored object as the adapter. Once a handle exists,
    /// further additions (including a re-delivered add for the same path)
    /// are ignored and no second power-on is ever requested.
    pub fn consider(&mut self, object: &RemoteObject) -> Option<AdapterSignal> {
        if self.handle.is_some() {
            return None;
        }
        if !object.interfaces.iter().any(|i| i == iface::ADAPTER) {
            return None;
        }
        if !self.matches_preference(&object.path) {
            debug!(path = %object.path, "skipping adapter not matching configured name");
            return None;
        }

        let powered = object.powered.unwrap_or(false);
        self.handle = Some(AdapterHandle {
            path: object.path.clone(),
            powered,
        });

        if powered {
            // Already powered: ready in the same tick, no bus round-trip.
            info!(path = %object.path, "adapter found, already powered");
            self.ready_signaled = true;
            Some(AdapterSignal::Ready)
        } else {
            info!(path = %object.path, "adapter found, not powered - powering on");
            self.power_on_requested = true;
            Some(AdapterSignal::PowerOn(object.path.clone()))
        }
    }

    /// Linear scan over the initial enumeration.
    pub fn scan(&mut self, objects: &[RemoteObject]) -> Option<AdapterSignal> {
        for object in objects {
            if let Some(signal) = self.consider(object) {
                return Some(signal);
            }
        }
        debug!("no adapter in the daemon's object tree yet");
        None
    }

    /// React to a `Powered` property change. Readiness is signaled from here
    /// and only here, never from the power-on request completion, so the
    /// relative arrival order of the two does not matter.
    pub fn on_powered_changed(
        &mut self,
        path: &OwnedObjectPath,
        powered: bool,
    ) -> Option<AdapterSignal> {
        let handle = match self.handle.as_mut() {
            Some(h) if h.path == *path => h,
            _ => return None,
        };
        handle.powered = powered;
        if powered && !self.ready_signaled {
            info!(path = %path, "adapter powered on");
            self.ready_signaled = true;
            Some(AdapterSignal::Ready)
        } else {
            if !powered && self.ready_signaled {
                warn!(path = %path, "adapter powered off externally");
            }
            None
        }
    }

    /// The power-on request itself finished. Informational: a failure is
    /// diagnosed here while the property change drives progress.
    pub fn on_power_on_completed(&self, result: &Result<(), String>) {
        match result {
            Ok(()) => debug!("power-on request completed"),
            Err(e) => warn!(error = %e, "power-on request failed; waiting on property change"),
        }
    }

    /// Returns true when the tracked adapter object was removed.
    pub fn on_object_removed(&mut self, path: &OwnedObjectPath, interfaces: &[String]) -> bool {
        let lost = match &self.handle {
            Some(h) if h.path == *path => {
                interfaces.is_empty() || interfaces.iter().any(|i| i == iface::ADAPTER)
            }
            _ => false,
        };
        if lost {
            warn!(path = %path, "adapter object removed by daemon");
            self.reset();
        }
        lost
    }
}
