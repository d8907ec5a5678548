//! Battery Service (0x180F)
//!
//! One read|notify `Battery Level` characteristic. The level is a shared
//! percentage cell sampled periodically from sysfs; while a central is
//! subscribed, changed samples are pushed as notifications.

use crate::infrastructure::gatt::characteristic::{
    push_value, CharacteristicHandler, GattError,
};
use crate::infrastructure::gatt::tree::{CharacteristicHandle, ServiceTree};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

pub const SERVICE_UUID: &str = "180f";
pub const LEVEL_CHARACTERISTIC_UUID: &str = "2a19";
const USER_DESCRIPTION_UUID: &str = "2901";

const DEFAULT_LEVEL: u8 = 50;

/// Last known battery percentage, shared between the GATT handler and the
/// sampling task.
pub struct BatteryState {
    level: AtomicU8,
}

impl BatteryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            level: AtomicU8::new(DEFAULT_LEVEL),
        })
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    /// Store a new sample. Out-of-range samples are logged and dropped.
    /// Returns true when the stored level actually changed.
    pub fn set_level(&self, percent: u8) -> bool {
        if percent > 100 {
            warn!(percent, "battery sample out of range, dropped");
            return false;
        }
        self.level.swap(percent, Ordering::Relaxed) != percent
    }
}

struct BatteryLevelHandler {
    state: Arc<BatteryState>,
}

impl CharacteristicHandler for BatteryLevelHandler {
    fn read(&self) -> Result<Vec<u8>, GattError> {
        Ok(vec![self.state.level()])
    }
}

/// Define the battery service on the tree. Returns the handle of the level
/// characteristic so the sampler can push to it once the tree is exported.
pub fn register(
    tree: &mut ServiceTree,
    state: Arc<BatteryState>,
) -> anyhow::Result<CharacteristicHandle> {
    let service = tree.add_service(SERVICE_UUID, true)?;
    let level = tree.add_characteristic(
        &service,
        LEVEL_CHARACTERISTIC_UUID,
        &["read", "notify"],
        Arc::new(BatteryLevelHandler {
            state: state.clone(),
        }),
    )?;
    tree.add_descriptor(
        &level,
        USER_DESCRIPTION_UUID,
        b"Battery level in percent".to_vec(),
    )?;
    Ok(level)
}

/// Sample the battery percentage forever. Missing hardware is normal (many
/// boards have no battery); the last level is simply held then.
pub async fn sample_battery(
    conn: Connection,
    level_path: OwnedObjectPath,
    state: Arc<BatteryState>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(percent) = read_capacity() else {
            continue;
        };
        if !state.set_level(percent) {
            continue;
        }
        debug!(percent, "battery level changed");
        match push_value(&conn, &level_path, vec![percent]).await {
            Ok(pushed) => {
                if pushed {
                    debug!(percent, "battery level pushed");
                }
            }
            Err(e) => warn!(error = %e, "could not push battery level"),
        }
    }
}

/// First readable `/sys/class/power_supply/*/capacity`, if any.
fn read_capacity() -> Option<u8> {
    let entries = fs::read_dir("/sys/class/power_supply").ok()?;
    for entry in entries.flatten() {
        let path: PathBuf = entry.path().join("capacity");
        if let Ok(contents) = fs::read_to_string(&path) {
            match contents.trim().parse::<u8>() {
                Ok(percent) => return Some(percent),
                Err(e) => warn!(path = %path.display(), error = %e, "unparsable capacity"),
            }
        }
    }
    None
}
