//! Remote Daemon Watcher
//!
//! Watches the Bluetooth daemon's well-known name and, while it is present,
//! mirrors the daemon's object tree. Name watching runs for the lifetime of
//! the process; one mirror task runs per daemon incarnation and is aborted
//! when the daemon vanishes.

use crate::domain::events::{Event, RemoteObject};
use crate::domain::iface;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use zbus::fdo::{DBusProxy, ObjectManagerProxy};
use zbus::names::{BusName, OwnedInterfaceName};
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::Connection;

/// Watch the daemon's bus name for the lifetime of the process, emitting
/// `DaemonAppeared` / `DaemonVanished`. An error here means the bus
/// connection itself is broken, which is fatal to the process.
pub async fn watch_daemon_name(
    conn: Connection,
    daemon_name: String,
    events: UnboundedSender<Event>,
) -> anyhow::Result<()> {
    let dbus = DBusProxy::new(&conn).await?;
    // Subscribe before the initial presence check so an appearance in
    // between cannot be missed; `present` deduplicates the overlap.
    let mut owner_changes = dbus
        .receive_name_owner_changed_with_args(&[(0, daemon_name.as_str())])
        .await?;

    let name = BusName::try_from(daemon_name.as_str())?;
    let mut present = dbus.name_has_owner(name).await?;
    if present {
        info!(name = %daemon_name, "daemon name is already owned");
        let _ = events.send(Event::DaemonAppeared);
    } else {
        info!(name = %daemon_name, "waiting for the daemon to appear");
    }

    while let Some(signal) = owner_changes.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!(error = %e, "malformed NameOwnerChanged signal");
                continue;
            }
        };
        let transition = classify_owner_change(
            present,
            args.old_owner().is_some(),
            args.new_owner().is_some(),
        );
        match transition {
            NameTransition::Appeared => {
                present = true;
                let _ = events.send(Event::DaemonAppeared);
            }
            NameTransition::Vanished => {
                present = false;
                let _ = events.send(Event::DaemonVanished);
            }
            NameTransition::Handover => {
                // The name moved to another owner without a gap. The new
                // owner knows nothing of our registrations, so this is a
                // restart as far as we are concerned.
                warn!(name = %daemon_name, "daemon name changed owner");
                let _ = events.send(Event::DaemonVanished);
                let _ = events.send(Event::DaemonAppeared);
            }
            NameTransition::Unchanged => {}
        }
    }

    anyhow::bail!("daemon name watch stream ended")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NameTransition {
    Appeared,
    Vanished,
    Handover,
    Unchanged,
}

/// Presence transition implied by one `NameOwnerChanged`, deduplicated
/// against what we already believe (the subscription overlaps the initial
/// `NameHasOwner` check, so a duplicate appearance is possible).
fn classify_owner_change(present: bool, had_owner: bool, has_owner: bool) -> NameTransition {
    match (present, had_owner, has_owner) {
        (true, true, true) => NameTransition::Handover,
        (false, _, true) => NameTransition::Appeared,
        (true, _, false) => NameTransition::Vanished,
        _ => NameTransition::Unchanged,
    }
}

/// Mirror the daemon's object tree for one incarnation: subscribe to the
/// change signals, run the initial enumeration, then forward every change
/// in bus order. The initial enumeration is retried with capped backoff —
/// the daemon's presence on the bus does not guarantee the call succeeds.
pub async fn mirror_daemon_objects(
    conn: Connection,
    daemon_name: String,
    epoch: u64,
    events: UnboundedSender<Event>,
) -> anyhow::Result<()> {
    let om = ObjectManagerProxy::builder(&conn)
        .destination(daemon_name.as_str())?
        .path("/")?
        .build()
        .await?;

    // Subscribe before enumerating so no change can fall in between.
    let mut added = om.receive_interfaces_added().await?;
    let mut removed = om.receive_interfaces_removed().await?;

    let mut delay = Duration::from_millis(250);
    let managed = loop {
        match om.get_managed_objects().await {
            Ok(objects) => break objects,
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "object enumeration failed, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(5));
            }
        }
    };

    let objects: Vec<RemoteObject> = managed
        .into_iter()
        .map(|(path, interfaces)| object_from_managed(path, interfaces))
        .collect();
    let _ = events.send(Event::MirrorReady { epoch, objects });

    loop {
        tokio::select! {
            signal = added.next() => {
                let Some(signal) = signal else {
                    anyhow::bail!("daemon object change stream ended")
                };
                let args = match signal.args() {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(error = %e, "malformed InterfacesAdded signal");
                        continue;
                    }
                };
                let path = OwnedObjectPath::from(args.object_path().to_owned());
                let interfaces: Vec<String> = args
                    .interfaces_and_properties()
                    .keys()
                    .map(|k| k.to_string())
                    .collect();
                let powered = args
                    .interfaces_and_properties()
                    .get(iface::ADAPTER)
                    .and_then(|props| props.get("Powered"))
                    .and_then(|v| v.downcast_ref::<bool>().ok());
                debug!(path = %path, ?interfaces, "interfaces added");
                let _ = events.send(Event::ObjectAdded {
                    epoch,
                    object: RemoteObject {
                        path,
                        interfaces,
                        powered,
                    },
                });
            }
            signal = removed.next() => {
                let Some(signal) = signal else {
                    anyhow::bail!("daemon object change stream ended")
                };
                let args = match signal.args() {
                    Ok(args) => args,
                    Err(e) => {
                        warn!(error = %e, "malformed InterfacesRemoved signal");
                        continue;
                    }
                };
                let path = OwnedObjectPath::from(args.object_path().to_owned());
                let interfaces: Vec<String> =
                    args.interfaces().iter().map(|i| i.to_string()).collect();
                debug!(path = %path, ?interfaces, "interfaces removed");
                let _ = events.send(Event::ObjectRemoved {
                    epoch,
                    path,
                    interfaces,
                });
            }
        }
    }
}

fn object_from_managed(
    path: OwnedObjectPath,
    interfaces: HashMap<OwnedInterfaceName, HashMap<String, OwnedValue>>,
) -> RemoteObject {
    let powered = interfaces
        .get(iface::ADAPTER)
        .and_then(|props| props.get("Powered"))
        .and_then(|v| v.downcast_ref::<bool>().ok());
    RemoteObject {
        path,
        interfaces: interfaces.keys().map(|k| k.to_string()).collect(),
        powered,
    }
}
