mod config;
mod domain;
mod infrastructure;
mod services;

use crate::config::SettingsService;
use crate::domain::coordinator::Coordinator;
use crate::domain::events::{Action, Event};
use crate::infrastructure::bluez::driver::BusDriver;
use crate::infrastructure::bluez::watcher;
use crate::infrastructure::gatt::advertisement::Advertisement;
use crate::infrastructure::gatt::tree::ServiceTree;
use crate::infrastructure::logging;
use crate::services::{battery, immediate_alert, modem_info};
use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use zbus::Connection;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Optional settings file path as the only CLI argument.
    let override_path = std::env::args().nth(1).map(PathBuf::from);
    let settings_service = SettingsService::new(override_path)?;
    let settings = settings_service.get().clone();
    let _logging_guard = logging::init(&settings.log_settings)?;
    info!(path = %settings_service.path().display(), "starting bluetooth services");

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let mut coordinator = Coordinator::new(settings.adapter.clone());

    // Define the local tree before touching the bus.
    let mut tree = ServiceTree::new(&settings.object_root)?;
    let battery_state = battery::BatteryState::new();
    let battery_level = battery::register(&mut tree, battery_state.clone())?;
    immediate_alert::register(&mut tree, Arc::new(immediate_alert::LogAlertSink))?;
    modem_info::register(
        &mut tree,
        settings.modem_serial.as_deref(),
        settings.modem_imei.as_deref(),
    )?;
    tree.set_advertisement(Advertisement::new(
        &settings.local_name,
        vec![
            battery::SERVICE_UUID.to_string(),
            immediate_alert::SERVICE_UUID.to_string(),
        ],
        settings.appearance,
        settings.advertising_timeout,
    ));
    let battery_path = tree.characteristic_path(&battery_level).clone();
    for action in coordinator.handle(Event::TreeDefined) {
        warn!(?action, "unexpected action before bus connection");
    }

    let conn = Connection::system()
        .await
        .context("connecting to the system bus")?;

    // The name watch starts before the export so a daemon already on the
    // bus is seen immediately.
    let mut watch_task = tokio::spawn(watcher::watch_daemon_name(
        conn.clone(),
        settings.daemon_bus_name.clone(),
        tx.clone(),
    ));

    let exported = tree.export(&conn).await?;
    conn.request_name(settings.application_bus_name.as_str())
        .await
        .with_context(|| format!("requesting bus name {}", settings.application_bus_name))?;
    info!(name = %settings.application_bus_name, "bus name acquired");

    tokio::spawn(battery::sample_battery(
        conn.clone(),
        battery_path,
        battery_state,
        Duration::from_secs(settings.battery_poll_secs),
    ));

    let mut driver = BusDriver::new(
        conn.clone(),
        settings.daemon_bus_name.clone(),
        exported.root.clone(),
        exported.advertisement.clone(),
        tx.clone(),
    );

    for action in coordinator.handle(Event::LocalNameAcquired) {
        driver.dispatch(action);
    }

    loop {
        tokio::select! {
            result = &mut watch_task => {
                let err = match result {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => anyhow::anyhow!("daemon name watch ended"),
                    Err(e) => anyhow::anyhow!(e),
                };
                return Err(err.context("daemon name watch failed"));
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    anyhow::bail!("event channel closed");
                };
                if matches!(event, Event::DaemonVanished) {
                    driver.on_daemon_vanished();
                }
                for action in coordinator.handle(event) {
                    if let Action::Fatal { reason } = action {
                        anyhow::bail!("unrecoverable bring-up failure: {reason}");
                    }
                    driver.dispatch(action);
                }
            }
        }
    }
}
