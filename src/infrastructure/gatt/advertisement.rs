//! LE Advertisement Object
//!
//! One `org.bluez.LEAdvertisement1` object describing the peripheral to the
//! daemon's advertising manager.

use tracing::info;
use zbus::interface;

pub struct Advertisement {
    local_name: String,
    service_uuids: Vec<String>,
    appearance: u16,
    timeout: u16,
}

impl Advertisement {
    pub fn new(
        local_name: &str,
        service_uuids: Vec<String>,
        appearance: u16,
        timeout: u16,
    ) -> Self {
        Self {
            local_name: local_name.to_string(),
            service_uuids,
            appearance,
            timeout,
        }
    }
}

#[interface(name = "org.bluez.LEAdvertisement1")]
impl Advertisement {
    #[zbus(property, name = "Type")]
    fn advertisement_type(&self) -> &str {
        "peripheral"
    }

    #[zbus(property)]
    fn local_name(&self) -> &str {
        &self.local_name
    }

    #[zbus(property, name = "ServiceUUIDs")]
    fn service_uuids(&self) -> Vec<String> {
        self.service_uuids.clone()
    }

    #[zbus(property)]
    fn appearance(&self) -> u16 {
        self.appearance
    }

    /// Zero means advertise indefinitely.
    #[zbus(property)]
    fn timeout(&self) -> u16 {
        self.timeout
    }

    /// Called by the daemon when it drops the advertisement. The object
    /// stays exported; re-registration happens through the normal bring-up
    /// sequence on the next daemon incarnation.
    fn release(&self) {
        info!(local_name = %self.local_name, "advertisement released by the daemon");
    }
}
