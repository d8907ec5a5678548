//! Coordinator Events and Actions
//!
//! Every asynchronous bus interaction is modeled as a typed event delivered
//! into the single event loop, and every outbound daemon call as a typed
//! action the bus driver executes. The coordinator itself never touches the
//! bus.

use zbus::zvariant::OwnedObjectPath;

/// One object currently exposed by the Bluetooth daemon.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    pub path: OwnedObjectPath,
    /// Interface names implemented at this path.
    pub interfaces: Vec<String>,
    /// Cached `Powered` value when the object carries the adapter interface.
    pub powered: Option<bool>,
}

/// Events delivered into the event loop.
///
/// Daemon-originated events carry the epoch current when they were issued;
/// the coordinator discards events from a previous daemon incarnation.
#[derive(Debug)]
pub enum Event {
    /// The local service tree is fully defined.
    TreeDefined,
    /// The tree is exported and our well-known bus name is owned.
    LocalNameAcquired,
    /// The daemon's well-known name appeared on the bus.
    DaemonAppeared,
    /// The daemon's well-known name vanished from the bus.
    DaemonVanished,
    /// The object mirror finished its initial enumeration pass.
    MirrorReady {
        epoch: u64,
        objects: Vec<RemoteObject>,
    },
    /// The object mirror could not be built or its change streams broke.
    MirrorFailed { epoch: u64, error: String },
    /// The daemon exposed interfaces at a path.
    ObjectAdded { epoch: u64, object: RemoteObject },
    /// The daemon removed interfaces from a path.
    ObjectRemoved {
        epoch: u64,
        path: OwnedObjectPath,
        interfaces: Vec<String>,
    },
    /// `Powered` property change on the tracked adapter.
    AdapterPoweredChanged {
        epoch: u64,
        path: OwnedObjectPath,
        powered: bool,
    },
    /// The async power-on request completed. Informational only: readiness
    /// is driven by the property change, never by this completion.
    PowerOnCompleted {
        epoch: u64,
        result: Result<(), String>,
    },
    /// `RegisterApplication` completed.
    ApplicationRegistered {
        epoch: u64,
        result: Result<(), String>,
    },
    /// `RegisterAdvertisement` completed.
    AdvertisementRegistered {
        epoch: u64,
        result: Result<(), String>,
    },
}

/// Outbound work for the bus driver. Each daemon-bound action is stamped
/// with the epoch it belongs to so its completion can be matched up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Build the daemon object mirror (initial enumeration + change streams).
    BuildMirror { epoch: u64 },
    /// Set `Powered = true` on the adapter and watch its `Powered` property.
    PowerOnAdapter {
        epoch: u64,
        adapter: OwnedObjectPath,
    },
    /// Call `RegisterApplication(root, {})` on the daemon's GATT manager.
    RegisterApplication {
        epoch: u64,
        gatt_manager: OwnedObjectPath,
    },
    /// Call `RegisterAdvertisement(path, {})` on the advertising manager.
    RegisterAdvertisement {
        epoch: u64,
        advertising_manager: OwnedObjectPath,
    },
    /// Unrecoverable condition; the process aborts and the host supervisor
    /// restarts it.
    Fatal { reason: String },
}
