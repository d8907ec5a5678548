//! Bus Driver
//!
//! Executes coordinator actions as asynchronous bus calls. Each call runs in
//! its own task and reports back by sending a typed completion event into
//! the event loop; nothing here ever blocks waiting for the daemon.

use crate::domain::events::{Action, Event};
use crate::infrastructure::bluez::proxies::{
    Adapter1Proxy, GattManager1Proxy, LEAdvertisingManager1Proxy,
};
use crate::infrastructure::bluez::watcher;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

pub struct BusDriver {
    conn: Connection,
    daemon_name: String,
    app_root: OwnedObjectPath,
    advertisement_path: OwnedObjectPath,
    events: UnboundedSender<Event>,
    /// Long-lived mirror of the current daemon incarnation.
    mirror_task: Option<JoinHandle<()>>,
    /// Power-on request plus Powered property watch.
    power_task: Option<JoinHandle<()>>,
}

impl BusDriver {
    pub fn new(
        conn: Connection,
        daemon_name: String,
        app_root: OwnedObjectPath,
        advertisement_path: OwnedObjectPath,
        events: UnboundedSender<Event>,
    ) -> Self {
        Self {
            conn,
            daemon_name,
            app_root,
            advertisement_path,
            events,
            mirror_task: None,
            power_task: None,
        }
    }

    /// Abort daemon-scoped tasks. Their late completions would be discarded
    /// by the coordinator's epoch check anyway; aborting stops us from
    /// issuing further calls to a daemon that is gone.
    pub fn on_daemon_vanished(&mut self) {
        if let Some(task) = self.mirror_task.take() {
            task.abort();
        }
        if let Some(task) = self.power_task.take() {
            task.abort();
        }
    }

    pub fn dispatch(&mut self, action: Action) {
        match action {
            Action::BuildMirror { epoch } => {
                if let Some(task) = self.mirror_task.take() {
                    task.abort();
                }
                let conn = self.conn.clone();
                let daemon_name = self.daemon_name.clone();
                let events = self.events.clone();
                self.mirror_task = Some(tokio::spawn(async move {
                    if let Err(e) =
                        watcher::mirror_daemon_objects(conn, daemon_name, epoch, events.clone())
                            .await
                    {
                        error!(error = %e, "daemon object mirror failed");
                        let _ = events.send(Event::MirrorFailed {
                            epoch,
                            error: e.to_string(),
                        });
                    }
                }));
            }
            Action::PowerOnAdapter { epoch, adapter } => {
                if let Some(task) = self.power_task.take() {
                    task.abort();
                }
                let conn = self.conn.clone();
                let daemon_name = self.daemon_name.clone();
                let events = self.events.clone();
                self.power_task = Some(tokio::spawn(async move {
                    if let Err(e) =
                        power_on_adapter(conn, daemon_name, adapter, epoch, events).await
                    {
                        warn!(error = %e, "adapter power watch failed");
                    }
                }));
            }
            Action::RegisterApplication { epoch, gatt_manager } => {
                let conn = self.conn.clone();
                let daemon_name = self.daemon_name.clone();
                let app_root = self.app_root.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = async {
                        let gm = GattManager1Proxy::builder(&conn)
                            .destination(daemon_name)?
                            .path(gatt_manager)?
                            .build()
                            .await?;
                        // Empty options map in the default configuration.
                        gm.register_application(&app_root, HashMap::new()).await
                    }
                    .await
                    .map_err(|e: zbus::Error| e.to_string());
                    let _ = events.send(Event::ApplicationRegistered { epoch, result });
                });
            }
            Action::RegisterAdvertisement {
                epoch,
                advertising_manager,
            } => {
                let conn = self.conn.clone();
                let daemon_name = self.daemon_name.clone();
                let advertisement_path = self.advertisement_path.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = async {
                        let lm = LEAdvertisingManager1Proxy::builder(&conn)
                            .destination(daemon_name)?
                            .path(advertising_manager)?
                            .build()
                            .await?;
                        lm.register_advertisement(&advertisement_path, HashMap::new())
                            .await
                    }
                    .await
                    .map_err(|e: zbus::Error| e.to_string());
                    let _ = events.send(Event::AdvertisementRegistered { epoch, result });
                });
            }
            // Fatal is handled by the event loop before dispatch.
            Action::Fatal { reason } => {
                error!(reason = %reason, "fatal action reached the driver");
            }
        }
    }
}

/// Issue the async `Powered = true` request and forward every `Powered`
/// change. The subscription is set up before the request so the property
/// signal cannot be missed; the request's completion and the property
/// change arrive in no particular order.
async fn power_on_adapter(
    conn: Connection,
    daemon_name: String,
    adapter_path: OwnedObjectPath,
    epoch: u64,
    events: UnboundedSender<Event>,
) -> anyhow::Result<()> {
    let adapter = Adapter1Proxy::builder(&conn)
        .destination(daemon_name)?
        .path(adapter_path.clone())?
        .build()
        .await?;

    let mut powered_changes = adapter.receive_powered_changed().await;

    let result = adapter.set_powered(true).await.map_err(|e| e.to_string());
    let _ = events.send(Event::PowerOnCompleted { epoch, result });

    while let Some(change) = powered_changes.next().await {
        match change.get().await {
            Ok(powered) => {
                let _ = events.send(Event::AdapterPoweredChanged {
                    epoch,
                    path: adapter_path.clone(),
                    powered,
                });
            }
            Err(e) => warn!(error = %e, "could not read Powered property change"),
        }
    }

    debug!("adapter property stream ended");
    Ok(())
}
