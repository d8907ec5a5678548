//! Registration Coordinator
//!
//! The top-level state machine. It tracks two independent progressions: the
//! daemon side (name watching, object mirror, adapter power) and the service
//! side (local tree definition, bus export, GATT application and
//! advertisement registration). Registration with the daemon starts at the
//! single synchronization point where the services are exported AND the
//! adapter is powered on, whichever of the two happens last.
//!
//! The coordinator is pure: it consumes typed events and emits typed actions
//! for the bus driver to execute. Every daemon-bound action carries the
//! current epoch; completions stamped with an older epoch belong to a daemon
//! incarnation that has since left the bus and are discarded.

use crate::domain::adapter::{AdapterController, AdapterSignal};
use crate::domain::events::{Action, Event, RemoteObject};
use crate::domain::iface;
use crate::domain::snapshot::RemoteObjectSnapshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    AwaitingDaemon,
    BuildingMirror,
    SearchingAdapter,
    PoweringOnAdapter,
    AdapterReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceState {
    Init,
    TreeBuilt,
    ExportedOnBus,
    RegisteringApplication,
    RegisteringAdvertisement,
    Running,
}

pub struct Coordinator {
    daemon_state: DaemonState,
    service_state: ServiceState,
    snapshot: RemoteObjectSnapshot,
    adapter: AdapterController,
    /// Bumped every time the daemon vanishes.
    epoch: u64,
}

impl Coordinator {
    pub fn new(adapter_preference: Option<String>) -> Self {
        Self {
            daemon_state: DaemonState::AwaitingDaemon,
            service_state: ServiceState::Init,
            snapshot: RemoteObjectSnapshot::new(),
            adapter: AdapterController::new(adapter_preference),
            epoch: 0,
        }
    }

    pub fn daemon_state(&self) -> DaemonState {
        self.daemon_state
    }

    pub fn service_state(&self) -> ServiceState {
        self.service_state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Process one event. Triggers not meaningful in the current state are
    /// no-ops.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        match event {
            Event::TreeDefined => {
                if self.service_state == ServiceState::Init {
                    self.service_state = ServiceState::TreeBuilt;
                } else {
                    warn!(state = ?self.service_state, "tree defined twice");
                }
                vec![]
            }
            Event::LocalNameAcquired => {
                if self.service_state == ServiceState::TreeBuilt {
                    info!("local bus name acquired, service tree is live");
                    self.service_state = ServiceState::ExportedOnBus;
                    self.try_register().into_iter().collect()
                } else {
                    warn!(state = ?self.service_state, "name acquired in unexpected state");
                    vec![]
                }
            }
            Event::DaemonAppeared => {
                if self.daemon_state == DaemonState::AwaitingDaemon {
                    info!("daemon appeared on the bus");
                    self.daemon_state = DaemonState::BuildingMirror;
                    vec![Action::BuildMirror { epoch: self.epoch }]
                } else {
                    warn!(state = ?self.daemon_state, "daemon appeared in unexpected state");
                    vec![]
                }
            }
            Event::DaemonVanished => {
                self.on_daemon_vanished();
                vec![]
            }
            Event::MirrorReady { epoch, objects } => {
                if self.stale(epoch) {
                    return vec![];
                }
                self.on_mirror_ready(objects)
            }
            Event::MirrorFailed { epoch, error } => {
                if self.stale(epoch) {
                    return vec![];
                }
                // The daemon is on the bus but we cannot subscribe to it;
                // the bus connection itself is suspect. Abort and let the
                // host supervisor restart the process.
                error!(error = %error, "daemon object mirror failed");
                vec![Action::Fatal {
                    reason: format!("daemon object mirror failed: {error}"),
                }]
            }
            Event::ObjectAdded { epoch, object } => {
                if self.stale(epoch) {
                    return vec![];
                }
                self.on_object_added(object)
            }
            Event::ObjectRemoved {
                epoch,
                path,
                interfaces,
            } => {
                if self.stale(epoch) {
                    return vec![];
                }
                debug!(path = %path, "daemon object removed");
                self.snapshot.remove(&path, &interfaces);
                if self.adapter.on_object_removed(&path, &interfaces)
                    && self.daemon_state != DaemonState::AwaitingDaemon
                {
                    // The daemon is still around; look for a replacement.
                    self.daemon_state = DaemonState::SearchingAdapter;
                }
                vec![]
            }
            Event::AdapterPoweredChanged {
                epoch,
                path,
                powered,
            } => {
                if self.stale(epoch) {
                    return vec![];
                }
                let signal = self.adapter.on_powered_changed(&path, powered);
                self.apply_adapter_signal(signal)
            }
            Event::PowerOnCompleted { epoch, result } => {
                if self.stale(epoch) {
                    return vec![];
                }
                self.adapter.on_power_on_completed(&result);
                vec![]
            }
            Event::ApplicationRegistered { epoch, result } => {
                if self.stale(epoch) {
                    return vec![];
                }
                self.on_application_registered(result)
            }
            Event::AdvertisementRegistered { epoch, result } => {
                if self.stale(epoch) {
                    return vec![];
                }
                self.on_advertisement_registered(result)
            }
        }
    }

    fn stale(&self, epoch: u64) -> bool {
        if epoch != self.epoch {
            debug!(
                event_epoch = epoch,
                current_epoch = self.epoch,
                "discarding event from a previous daemon incarnation"
            );
            true
        } else {
            false
        }
    }

    fn on_daemon_vanished(&mut self) {
        info!("daemon vanished from the bus");
        self.epoch += 1;
        self.snapshot.clear();
        self.adapter.reset();
        self.daemon_state = DaemonState::AwaitingDaemon;
        // The local tree stays published; daemon-side registrations are gone.
        if self.service_state > ServiceState::ExportedOnBus {
            warn!(
                state = ?self.service_state,
                "dropping daemon registrations, re-arming discovery"
            );
            self.service_state = ServiceState::ExportedOnBus;
        }
    }

    fn on_mirror_ready(&mut self, objects: Vec<RemoteObject>) -> Vec<Action> {
        if self.daemon_state != DaemonState::BuildingMirror {
            warn!(state = ?self.daemon_state, "mirror ready in unexpected state");
            return vec![];
        }
        info!(objects = objects.len(), "daemon object mirror is live");
        self.snapshot.reset(
            objects
                .iter()
                .map(|o| (o.path.clone(), o.interfaces.clone())),
        );
        self.daemon_state = DaemonState::SearchingAdapter;
        let signal = self.adapter.scan(&objects);
        self.apply_adapter_signal(signal)
    }

    fn on_object_added(&mut self, object: RemoteObject) -> Vec<Action> {
        debug!(path = %object.path, "daemon object added");
        self.snapshot
            .add(object.path.clone(), object.interfaces.clone());

        match self.daemon_state {
            DaemonState::SearchingAdapter => {
                let signal = self.adapter.consider(&object);
                self.apply_adapter_signal(signal)
            }
            DaemonState::AdapterReady
                if self.service_state == ServiceState::ExportedOnBus =>
            {
                // A manager object may show up after the adapter did.
                self.try_register().into_iter().collect()
            }
            _ => vec![],
        }
    }

    fn apply_adapter_signal(&mut self, signal: Option<AdapterSignal>) -> Vec<Action> {
        match signal {
            Some(AdapterSignal::PowerOn(path)) => {
                self.daemon_state = DaemonState::PoweringOnAdapter;
                vec![Action::PowerOnAdapter {
                    epoch: self.epoch,
                    adapter: path,
                }]
            }
            Some(AdapterSignal::Ready) => {
                self.daemon_state = DaemonState::AdapterReady;
                self.try_register().into_iter().collect()
            }
            None => vec![],
        }
    }

    /// The join condition. Called from both asynchronous chains; whichever
    /// side completes second performs the transition, and the ServiceState
    /// guard makes it happen exactly once.
    fn try_register(&mut self) -> Option<Action> {
        if self.service_state != ServiceState::ExportedOnBus {
            info!("not registering with daemon: services are not on the bus yet");
            return None;
        }
        if self.daemon_state != DaemonState::AdapterReady {
            info!("not registering with daemon: adapter is not powered on yet");
            return None;
        }
        // The manager is looked up at the moment it is needed; it may live
        // at a different path than the adapter.
        let manager = self
            .snapshot
            .first_with_interface(iface::GATT_MANAGER)
            .cloned();
        match manager {
            Some(gatt_manager) => {
                info!(manager = %gatt_manager, "registering GATT application");
                self.service_state = ServiceState::RegisteringApplication;
                Some(Action::RegisterApplication {
                    epoch: self.epoch,
                    gatt_manager,
                })
            }
            None => {
                warn!("adapter is ready but the daemon exposes no GATT manager yet");
                None
            }
        }
    }

    fn on_application_registered(&mut self, result: Result<(), String>) -> Vec<Action> {
        if self.service_state != ServiceState::RegisteringApplication {
            warn!(state = ?self.service_state, "application registration completed in unexpected state");
            return vec![];
        }
        match result {
            Ok(()) => {
                info!("GATT application registered");
                self.service_state = ServiceState::RegisteringAdvertisement;
                let manager = self
                    .snapshot
                    .first_with_interface(iface::LE_ADVERTISING_MANAGER)
                    .cloned();
                match manager {
                    Some(advertising_manager) => vec![Action::RegisterAdvertisement {
                        epoch: self.epoch,
                        advertising_manager,
                    }],
                    None => vec![Action::Fatal {
                        reason: "daemon exposes no LE advertising manager".to_string(),
                    }],
                }
            }
            Err(e) => {
                error!(error = %e, "daemon rejected the GATT application");
                vec![Action::Fatal {
                    reason: format!("application registration rejected: {e}"),
                }]
            }
        }
    }

    fn on_advertisement_registered(&mut self, result: Result<(), String>) -> Vec<Action> {
        if self.service_state != ServiceState::RegisteringAdvertisement {
            warn!(state = ?self.service_state, "advertisement registration completed in unexpected state");
            return vec![];
        }
        match result {
            Ok(()) => {
                info!("advertisement registered; services are running");
                self.service_state = ServiceState::Running;
                vec![]
            }
            Err(e) => {
                error!(error = %e, "daemon rejected the advertisement");
                vec![Action::Fatal {
                    reason: format!("advertisement registration rejected: {e}"),
                }]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbus::zvariant::OwnedObjectPath;

    const ADAPTER_PATH: &str = "/org/bluez/hci0";

    fn path(s: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(s).unwrap()
    }

    fn adapter_object(powered: bool) -> RemoteObject {
        RemoteObject {
            path: path(ADAPTER_PATH),
            interfaces: vec![
                iface::ADAPTER.to_string(),
                iface::GATT_MANAGER.to_string(),
                iface::LE_ADVERTISING_MANAGER.to_string(),
            ],
            powered: Some(powered),
        }
    }

    fn mirror_ready(c: &Coordinator, objects: Vec<RemoteObject>) -> Event {
        Event::MirrorReady {
            epoch: c.epoch(),
            objects,
        }
    }

    /// Drive the daemon side to AdapterReady with a pre-powered adapter.
    fn daemon_chain(c: &mut Coordinator) -> Vec<Action> {
        let mut actions = c.handle(Event::DaemonAppeared);
        actions.extend(c.handle(mirror_ready(c, vec![adapter_object(true)])));
        actions
    }

    /// Drive the service side to ExportedOnBus.
    fn service_chain(c: &mut Coordinator) -> Vec<Action> {
        let mut actions = c.handle(Event::TreeDefined);
        actions.extend(c.handle(Event::LocalNameAcquired));
        actions
    }

    fn register_application_count(actions: &[Action]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, Action::RegisterApplication { .. }))
            .count()
    }

    #[test]
    fn join_condition_name_first_then_adapter() {
        let mut c = Coordinator::new(None);
        let mut actions = service_chain(&mut c);
        assert_eq!(register_application_count(&actions), 0);
        assert_eq!(c.service_state(), ServiceState::ExportedOnBus);

        actions.extend(daemon_chain(&mut c));
        assert_eq!(register_application_count(&actions), 1);
        assert_eq!(c.service_state(), ServiceState::RegisteringApplication);
    }

    #[test]
    fn join_condition_adapter_first_then_name() {
        let mut c = Coordinator::new(None);
        let mut actions = daemon_chain(&mut c);
        assert_eq!(register_application_count(&actions), 0);
        assert_eq!(c.daemon_state(), DaemonState::AdapterReady);

        actions.extend(service_chain(&mut c));
        assert_eq!(register_application_count(&actions), 1);
        assert_eq!(c.service_state(), ServiceState::RegisteringApplication);
    }

    #[test]
    fn scenario_a_pre_powered_adapter_skips_power_on() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        let actions = daemon_chain(&mut c);
        assert!(actions
            .iter()
            .all(|a| !matches!(a, Action::PowerOnAdapter { .. })));
        assert_eq!(c.daemon_state(), DaemonState::AdapterReady);
    }

    #[test]
    fn scenario_b_cold_adapter_waits_for_property_change() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);

        c.handle(Event::DaemonAppeared);
        let actions = c.handle(mirror_ready(&c, vec![adapter_object(false)]));
        assert_eq!(
            actions,
            vec![Action::PowerOnAdapter {
                epoch: 0,
                adapter: path(ADAPTER_PATH),
            }]
        );
        assert_eq!(c.daemon_state(), DaemonState::PoweringOnAdapter);

        // The request's own completion must not advance the state machine.
        let actions = c.handle(Event::PowerOnCompleted {
            epoch: 0,
            result: Ok(()),
        });
        assert!(actions.is_empty());
        assert_eq!(c.daemon_state(), DaemonState::PoweringOnAdapter);

        let actions = c.handle(Event::AdapterPoweredChanged {
            epoch: 0,
            path: path(ADAPTER_PATH),
            powered: true,
        });
        assert_eq!(register_application_count(&actions), 1);
        assert_eq!(c.daemon_state(), DaemonState::AdapterReady);
    }

    #[test]
    fn scenario_c_daemon_absent_at_startup() {
        let mut c = Coordinator::new(None);
        let actions = service_chain(&mut c);
        assert!(actions.is_empty());
        assert_eq!(c.daemon_state(), DaemonState::AwaitingDaemon);

        let actions = daemon_chain(&mut c);
        assert_eq!(register_application_count(&actions), 1);
    }

    #[test]
    fn scenario_d_rejected_application_is_fatal_without_advertisement() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        daemon_chain(&mut c);

        let actions = c.handle(Event::ApplicationRegistered {
            epoch: 0,
            result: Err("org.bluez.Error.Failed".to_string()),
        });
        assert!(matches!(actions.as_slice(), [Action::Fatal { .. }]));
        assert!(actions
            .iter()
            .all(|a| !matches!(a, Action::RegisterAdvertisement { .. })));
    }

    #[test]
    fn full_bring_up_reaches_running() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        daemon_chain(&mut c);

        let actions = c.handle(Event::ApplicationRegistered {
            epoch: 0,
            result: Ok(()),
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::RegisterAdvertisement { .. }]
        ));

        let actions = c.handle(Event::AdvertisementRegistered {
            epoch: 0,
            result: Ok(()),
        });
        assert!(actions.is_empty());
        assert_eq!(c.service_state(), ServiceState::Running);
    }

    #[test]
    fn mirror_failure_is_fatal() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        c.handle(Event::DaemonAppeared);

        let actions = c.handle(Event::MirrorFailed {
            epoch: 0,
            error: "org.freedesktop.DBus.Error.NoReply".to_string(),
        });
        assert!(matches!(actions.as_slice(), [Action::Fatal { .. }]));
    }

    #[test]
    fn stale_mirror_failure_after_vanish_is_discarded() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        c.handle(Event::DaemonAppeared);
        c.handle(Event::DaemonVanished);

        // The aborted incarnation's mirror task reports its failure late.
        let actions = c.handle(Event::MirrorFailed {
            epoch: 0,
            error: "stream ended".to_string(),
        });
        assert!(actions.is_empty());
        assert_eq!(c.daemon_state(), DaemonState::AwaitingDaemon);
    }

    #[test]
    fn re_added_adapter_after_ready_triggers_nothing() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        daemon_chain(&mut c);
        // Registration is already in flight; a re-delivered add for the
        // adapter must not power on or register again.
        let actions = c.handle(Event::ObjectAdded {
            epoch: 0,
            object: adapter_object(true),
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn adapter_found_later_through_object_added() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        c.handle(Event::DaemonAppeared);
        let actions = c.handle(mirror_ready(&c, vec![]));
        assert!(actions.is_empty());
        assert_eq!(c.daemon_state(), DaemonState::SearchingAdapter);

        let actions = c.handle(Event::ObjectAdded {
            epoch: 0,
            object: adapter_object(true),
        });
        assert_eq!(register_application_count(&actions), 1);
    }

    #[test]
    fn gatt_manager_at_a_different_path_than_the_adapter() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        c.handle(Event::DaemonAppeared);

        let adapter = RemoteObject {
            path: path(ADAPTER_PATH),
            interfaces: vec![iface::ADAPTER.to_string()],
            powered: Some(true),
        };
        let manager = RemoteObject {
            path: path("/org/bluez/managers"),
            interfaces: vec![
                iface::GATT_MANAGER.to_string(),
                iface::LE_ADVERTISING_MANAGER.to_string(),
            ],
            powered: None,
        };
        let actions = c.handle(mirror_ready(&c, vec![adapter, manager]));
        assert_eq!(
            actions,
            vec![Action::RegisterApplication {
                epoch: 0,
                gatt_manager: path("/org/bluez/managers"),
            }]
        );
    }

    #[test]
    fn registration_stalls_until_a_gatt_manager_appears() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        c.handle(Event::DaemonAppeared);

        let bare_adapter = RemoteObject {
            path: path(ADAPTER_PATH),
            interfaces: vec![iface::ADAPTER.to_string()],
            powered: Some(true),
        };
        let actions = c.handle(mirror_ready(&c, vec![bare_adapter]));
        assert!(actions.is_empty());
        assert_eq!(c.service_state(), ServiceState::ExportedOnBus);

        let actions = c.handle(Event::ObjectAdded {
            epoch: 0,
            object: RemoteObject {
                path: path("/org/bluez/managers"),
                interfaces: vec![iface::GATT_MANAGER.to_string()],
                powered: None,
            },
        });
        assert_eq!(register_application_count(&actions), 1);
    }

    #[test]
    fn vanish_regresses_both_state_machines_and_bumps_epoch() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        daemon_chain(&mut c);
        c.handle(Event::ApplicationRegistered {
            epoch: 0,
            result: Ok(()),
        });
        c.handle(Event::AdvertisementRegistered {
            epoch: 0,
            result: Ok(()),
        });
        assert_eq!(c.service_state(), ServiceState::Running);

        c.handle(Event::DaemonVanished);
        assert_eq!(c.daemon_state(), DaemonState::AwaitingDaemon);
        assert_eq!(c.service_state(), ServiceState::ExportedOnBus);
        assert_eq!(c.epoch(), 1);

        // The daemon comes back; bring-up repeats under the new epoch.
        let actions = daemon_chain(&mut c);
        assert_eq!(register_application_count(&actions), 1);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::RegisterApplication { epoch: 1, .. }
        )));
    }

    #[test]
    fn stale_completions_are_discarded_after_vanish() {
        let mut c = Coordinator::new(None);
        service_chain(&mut c);
        daemon_chain(&mut c);
        assert_eq!(c.service_state(), ServiceState::RegisteringApplication);

        c.handle(Event::DaemonVanished);

        // The in-flight registration from the old incarnation completes late.
        let actions = c.handle(Event::ApplicationRegistered {
            epoch: 0,
            result: Ok(()),
        });
        assert!(actions.is_empty());
        assert_eq!(c.service_state(), ServiceState::ExportedOnBus);
    }

    #[test]
    fn vanish_before_export_leaves_service_state_alone() {
        let mut c = Coordinator::new(None);
        c.handle(Event::TreeDefined);
        c.handle(Event::DaemonAppeared);
        c.handle(Event::DaemonVanished);
        assert_eq!(c.service_state(), ServiceState::TreeBuilt);
        assert_eq!(c.daemon_state(), DaemonState::AwaitingDaemon);
    }
}
