pub mod bluez;
pub mod gatt;
pub mod logging;
