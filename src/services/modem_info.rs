//! Modem Identity Service (0x180A)
//!
//! Two read-only identity strings, serial number (0x2A25) and IMEI (0x2A27).
//! Values come from configuration; a board without them reports "unknown".

use crate::infrastructure::gatt::characteristic::{CharacteristicHandler, GattError};
use crate::infrastructure::gatt::tree::ServiceTree;
use std::sync::Arc;

pub const SERVICE_UUID: &str = "180a";
pub const SERIAL_CHARACTERISTIC_UUID: &str = "2a25";
pub const IMEI_CHARACTERISTIC_UUID: &str = "2a27";

struct IdentityHandler {
    value: Vec<u8>,
}

impl IdentityHandler {
    fn new(value: Option<&str>) -> Self {
        Self {
            value: value.unwrap_or("unknown").as_bytes().to_vec(),
        }
    }
}

impl CharacteristicHandler for IdentityHandler {
    fn read(&self) -> Result<Vec<u8>, GattError> {
        Ok(self.value.clone())
    }
}

pub fn register(
    tree: &mut ServiceTree,
    serial: Option<&str>,
    imei: Option<&str>,
) -> anyhow::Result<()> {
    let service = tree.add_service(SERVICE_UUID, true)?;
    tree.add_characteristic(
        &service,
        SERIAL_CHARACTERISTIC_UUID,
        &["read"],
        Arc::new(IdentityHandler::new(serial)),
    )?;
    tree.add_characteristic(
        &service,
        IMEI_CHARACTERISTIC_UUID,
        &["read"],
        Arc::new(IdentityHandler::new(imei)),
    )?;
    Ok(())
}
