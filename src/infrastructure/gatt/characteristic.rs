//! GATT Characteristic and Descriptor Objects
//!
//! The D-Bus objects the daemon calls into on behalf of remote centrals.
//! Application behavior lives in a `CharacteristicHandler`; the objects here
//! only adapt it to the `org.bluez.GattCharacteristic1` / `GattDescriptor1`
//! interfaces.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};
use zbus::interface;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, Value};
use zbus::Connection;

#[derive(Debug, Error)]
pub enum GattError {
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("value unavailable: {0}")]
    Unavailable(String),
}

impl From<GattError> for zbus::fdo::Error {
    fn from(e: GattError) -> Self {
        match e {
            GattError::NotSupported => {
                zbus::fdo::Error::NotSupported("operation not supported".to_string())
            }
            GattError::InvalidValue(msg) => zbus::fdo::Error::InvalidArgs(msg),
            GattError::Unavailable(msg) => zbus::fdo::Error::Failed(msg),
        }
    }
}

/// Leaf callbacks bound to one characteristic. All methods have defaults so
/// a handler only implements what its flags advertise.
pub trait CharacteristicHandler: Send + Sync {
    fn read(&self) -> Result<Vec<u8>, GattError> {
        Err(GattError::NotSupported)
    }

    fn write(&self, _value: &[u8]) -> Result<(), GattError> {
        Err(GattError::NotSupported)
    }

    fn notify_started(&self) {}

    fn notify_stopped(&self) {}
}

pub struct Characteristic {
    uuid: String,
    service: OwnedObjectPath,
    flags: Vec<String>,
    value: Vec<u8>,
    notifying: bool,
    handler: Arc<dyn CharacteristicHandler>,
}

impl Characteristic {
    pub fn new(
        uuid: &str,
        service: OwnedObjectPath,
        flags: &[&str],
        handler: Arc<dyn CharacteristicHandler>,
    ) -> Self {
        Self {
            uuid: uuid.to_string(),
            service,
            flags: flags.iter().map(|f| f.to_string()).collect(),
            value: Vec::new(),
            notifying: false,
            handler,
        }
    }

    pub fn service_path(&self) -> &OwnedObjectPath {
        &self.service
    }
}

#[interface(name = "org.bluez.GattCharacteristic1")]
impl Characteristic {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> &str {
        &self.uuid
    }

    #[zbus(property)]
    fn service(&self) -> ObjectPath<'_> {
        self.service.as_ref()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    #[zbus(property)]
    fn value(&self) -> Vec<u8> {
        self.value.clone()
    }

    #[zbus(property)]
    fn notifying(&self) -> bool {
        self.notifying
    }

    fn read_value(
        &mut self,
        _options: HashMap<&str, Value<'_>>,
    ) -> zbus::fdo::Result<Vec<u8>> {
        let value = self.handler.read().map_err(zbus::fdo::Error::from)?;
        trace!(uuid = %self.uuid, len = value.len(), "read");
        self.value = value.clone();
        Ok(value)
    }

    fn write_value(
        &mut self,
        value: Vec<u8>,
        _options: HashMap<&str, Value<'_>>,
    ) -> zbus::fdo::Result<()> {
        // A malformed payload is logged but the call still completes, so the
        // peer is never left hanging on a bad write.
        match self.handler.write(&value) {
            Ok(()) => {
                trace!(uuid = %self.uuid, len = value.len(), "write");
                self.value = value;
            }
            Err(e) => warn!(uuid = %self.uuid, error = %e, "rejected write value"),
        }
        Ok(())
    }

    async fn start_notify(
        &mut self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        if self.notifying {
            return Ok(());
        }
        debug!(uuid = %self.uuid, "notifications enabled");
        self.notifying = true;
        if let Ok(value) = self.handler.read() {
            self.value = value;
        }
        self.handler.notify_started();
        self.notifying_changed(&emitter).await?;
        self.value_changed(&emitter).await?;
        Ok(())
    }

    async fn stop_notify(
        &mut self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> zbus::fdo::Result<()> {
        if !self.notifying {
            return Ok(());
        }
        debug!(uuid = %self.uuid, "notifications disabled");
        self.notifying = false;
        self.handler.notify_stopped();
        self.notifying_changed(&emitter).await?;
        Ok(())
    }
}

/// Push a new value to a characteristic that is already on the bus. Emits
/// the property change subscribed centrals see as a notification. Returns
/// false when no central is subscribed (the value is not updated then,
/// matching read-through handlers being the source of truth).
pub async fn push_value(
    conn: &Connection,
    path: &OwnedObjectPath,
    value: Vec<u8>,
) -> anyhow::Result<bool> {
    let iface = conn
        .object_server()
        .interface::<_, Characteristic>(path.as_ref())
        .await?;
    let mut characteristic = iface.get_mut().await;
    if !characteristic.notifying {
        return Ok(false);
    }
    characteristic.value = value;
    characteristic.value_changed(iface.signal_emitter()).await?;
    Ok(true)
}

pub struct Descriptor {
    uuid: String,
    characteristic: OwnedObjectPath,
    flags: Vec<String>,
    value: Vec<u8>,
}

impl Descriptor {
    pub fn new(uuid: &str, characteristic: OwnedObjectPath, value: Vec<u8>) -> Self {
        Self {
            uuid: uuid.to_string(),
            characteristic,
            flags: vec!["read".to_string()],
            value,
        }
    }

    pub fn characteristic_path(&self) -> &OwnedObjectPath {
        &self.characteristic
    }
}

#[interface(name = "org.bluez.GattDescriptor1")]
impl Descriptor {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> &str {
        &self.uuid
    }

    #[zbus(property)]
    fn characteristic(&self) -> ObjectPath<'_> {
        self.characteristic.as_ref()
    }

    #[zbus(property)]
    fn flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    fn read_value(&self, _options: HashMap<&str, Value<'_>>) -> zbus::fdo::Result<Vec<u8>> {
        Ok(self.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReadOnly;
    impl CharacteristicHandler for ReadOnly {
        fn read(&self) -> Result<Vec<u8>, GattError> {
            Ok(vec![42])
        }
    }

    #[test]
    fn default_handler_rejects_unimplemented_operations() {
        let handler = ReadOnly;
        assert_eq!(handler.read().unwrap(), vec![42]);
        assert!(matches!(
            handler.write(&[1]),
            Err(GattError::NotSupported)
        ));
    }

    struct OneByteOnly;
    impl CharacteristicHandler for OneByteOnly {
        fn write(&self, value: &[u8]) -> Result<(), GattError> {
            if value.len() == 1 {
                Ok(())
            } else {
                Err(GattError::InvalidValue(format!(
                    "expected one byte, got {}",
                    value.len()
                )))
            }
        }
    }

    fn write_characteristic() -> Characteristic {
        Characteristic::new(
            "2a06",
            OwnedObjectPath::try_from("/io/mangoh/service0").unwrap(),
            &["write"],
            Arc::new(OneByteOnly),
        )
    }

    #[test]
    fn rejected_write_still_completes_without_storing() {
        let mut characteristic = write_characteristic();
        // The peer must get a reply even for a malformed payload.
        assert!(characteristic
            .write_value(vec![9, 9], HashMap::new())
            .is_ok());
        assert!(characteristic.value.is_empty());
    }

    #[test]
    fn accepted_write_stores_the_value() {
        let mut characteristic = write_characteristic();
        characteristic.write_value(vec![1], HashMap::new()).unwrap();
        assert_eq!(characteristic.value, vec![1]);
    }

    #[test]
    fn gatt_errors_map_to_dbus_errors() {
        assert!(matches!(
            zbus::fdo::Error::from(GattError::NotSupported),
            zbus::fdo::Error::NotSupported(_)
        ));
        assert!(matches!(
            zbus::fdo::Error::from(GattError::InvalidValue("bad".to_string())),
            zbus::fdo::Error::InvalidArgs(_)
        ));
    }
}
