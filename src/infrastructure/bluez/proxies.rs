//! zbus proxies for the daemon-side BlueZ interfaces we call.

use std::collections::HashMap;
use zbus::proxy;
use zbus::zvariant::{ObjectPath, Value};

#[proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
pub trait Adapter1 {
    #[zbus(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_powered(&self, powered: bool) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.bluez.GattManager1",
    default_service = "org.bluez",
    assume_defaults = false
)]
pub trait GattManager1 {
    fn register_application(
        &self,
        application: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.bluez.LEAdvertisingManager1",
    default_service = "org.bluez",
    assume_defaults = false
)]
pub trait LEAdvertisingManager1 {
    fn register_advertisement(
        &self,
        advertisement: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<()>;
}
