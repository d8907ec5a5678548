pub mod adapter;
pub mod coordinator;
pub mod events;
pub mod snapshot;

/// BlueZ D-Bus interface names the coordinator matches on.
pub mod iface {
    pub const ADAPTER: &str = "org.bluez.Adapter1";
    pub const GATT_MANAGER: &str = "org.bluez.GattManager1";
    pub const LE_ADVERTISING_MANAGER: &str = "org.bluez.LEAdvertisingManager1";
}
