//! Local Service Tree
//!
//! Collects GATT services, characteristics and descriptors under one
//! application root, derives their object paths deterministically, and
//! exports the whole hierarchy on the bus in a single pass. Paths follow
//! the `{root}/serviceN/charM/descK` scheme, numbered in definition order,
//! so the tree looks the same on every run with the same definitions.

use crate::infrastructure::gatt::advertisement::Advertisement;
use crate::infrastructure::gatt::characteristic::{
    Characteristic, CharacteristicHandler, Descriptor,
};
use anyhow::Context;
use std::sync::Arc;
use tracing::{debug, info};
use zbus::zvariant::OwnedObjectPath;
use zbus::Connection;

pub struct Service {
    uuid: String,
    primary: bool,
}

#[zbus::interface(name = "org.bluez.GattService1")]
impl Service {
    #[zbus(property, name = "UUID")]
    fn uuid(&self) -> &str {
        &self.uuid
    }

    #[zbus(property)]
    fn primary(&self) -> bool {
        self.primary
    }
}

/// Opaque reference to a defined service, used to attach characteristics.
#[derive(Debug, Clone, Copy)]
pub struct ServiceHandle {
    index: usize,
}

/// Opaque reference to a defined characteristic, used to attach descriptors
/// and to address the exported object later (value pushes).
#[derive(Debug, Clone, Copy)]
pub struct CharacteristicHandle {
    index: usize,
}

struct ServiceEntry {
    path: OwnedObjectPath,
    service: Service,
    characteristic_count: usize,
}

struct CharacteristicEntry {
    path: OwnedObjectPath,
    characteristic: Characteristic,
    descriptor_count: usize,
}

struct DescriptorEntry {
    path: OwnedObjectPath,
    descriptor: Descriptor,
}

pub struct ServiceTree {
    root: OwnedObjectPath,
    services: Vec<ServiceEntry>,
    characteristics: Vec<CharacteristicEntry>,
    descriptors: Vec<DescriptorEntry>,
    advertisement: Option<Advertisement>,
}

impl ServiceTree {
    pub fn new(root: &str) -> anyhow::Result<Self> {
        let root = OwnedObjectPath::try_from(root)
            .with_context(|| format!("invalid application root path {root:?}"))?;
        Ok(Self {
            root,
            services: Vec::new(),
            characteristics: Vec::new(),
            descriptors: Vec::new(),
            advertisement: None,
        })
    }

    pub fn add_service(&mut self, uuid: &str, primary: bool) -> anyhow::Result<ServiceHandle> {
        let path = child_path(&self.root, "service", self.services.len())?;
        debug!(path = %path, uuid, "defined service");
        self.services.push(ServiceEntry {
            path,
            service: Service {
                uuid: uuid.to_string(),
                primary,
            },
            characteristic_count: 0,
        });
        Ok(ServiceHandle {
            index: self.services.len() - 1,
        })
    }

    pub fn add_characteristic(
        &mut self,
        service: &ServiceHandle,
        uuid: &str,
        flags: &[&str],
        handler: Arc<dyn CharacteristicHandler>,
    ) -> anyhow::Result<CharacteristicHandle> {
        let entry = &mut self.services[service.index];
        let path = child_path(&entry.path, "char", entry.characteristic_count)?;
        entry.characteristic_count += 1;
        debug!(path = %path, uuid, ?flags, "defined characteristic");
        self.characteristics.push(CharacteristicEntry {
            path,
            characteristic: Characteristic::new(uuid, entry.path.clone(), flags, handler),
            descriptor_count: 0,
        });
        Ok(CharacteristicHandle {
            index: self.characteristics.len() - 1,
        })
    }

    pub fn add_descriptor(
        &mut self,
        characteristic: &CharacteristicHandle,
        uuid: &str,
        value: Vec<u8>,
    ) -> anyhow::Result<()> {
        let entry = &mut self.characteristics[characteristic.index];
        let path = child_path(&entry.path, "desc", entry.descriptor_count)?;
        entry.descriptor_count += 1;
        debug!(path = %path, uuid, "defined descriptor");
        self.descriptors.push(DescriptorEntry {
            path,
            descriptor: Descriptor::new(uuid, entry.path.clone(), value),
        });
        Ok(())
    }

    pub fn set_advertisement(&mut self, advertisement: Advertisement) {
        self.advertisement = Some(advertisement);
    }

    pub fn service_path(&self, handle: &ServiceHandle) -> &OwnedObjectPath {
        &self.services[handle.index].path
    }

    pub fn characteristic_path(&self, handle: &CharacteristicHandle) -> &OwnedObjectPath {
        &self.characteristics[handle.index].path
    }

    pub fn advertisement_path(&self) -> anyhow::Result<OwnedObjectPath> {
        child(&self.root, "advertisement")
    }

    /// Export every object in the tree. The application root carries an
    /// `ObjectManager` so the daemon can enumerate the hierarchy when the
    /// application is registered. Consumes the tree; after this the objects
    /// are owned by the bus connection.
    pub async fn export(self, conn: &Connection) -> anyhow::Result<ExportedTree> {
        let advertisement_path = self.advertisement_path()?;
        let advertisement = self
            .advertisement
            .context("no advertisement was defined before export")?;

        let server = conn.object_server();
        export_at(server, &self.root, zbus::fdo::ObjectManager).await?;
        for entry in self.services {
            export_at(server, &entry.path, entry.service).await?;
        }
        for entry in self.characteristics {
            export_at(server, &entry.path, entry.characteristic).await?;
        }
        for entry in self.descriptors {
            export_at(server, &entry.path, entry.descriptor).await?;
        }
        export_at(server, &advertisement_path, advertisement).await?;

        info!(root = %self.root, "local object tree exported");
        Ok(ExportedTree {
            root: self.root,
            advertisement: advertisement_path,
        })
    }
}

/// Paths of the exported hierarchy that later stages still need.
pub struct ExportedTree {
    pub root: OwnedObjectPath,
    pub advertisement: OwnedObjectPath,
}

async fn export_at<I>(
    server: &zbus::ObjectServer,
    path: &OwnedObjectPath,
    iface: I,
) -> anyhow::Result<()>
where
    I: zbus::object_server::Interface,
{
    let added = server
        .at(path.as_ref(), iface)
        .await
        .with_context(|| format!("exporting {path}"))?;
    anyhow::ensure!(added, "object already exported at {path}");
    Ok(())
}

fn child_path(parent: &OwnedObjectPath, stem: &str, index: usize) -> anyhow::Result<OwnedObjectPath> {
    child(parent, &format!("{stem}{index}"))
}

fn child(parent: &OwnedObjectPath, segment: &str) -> anyhow::Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(format!("{parent}/{segment}"))
        .with_context(|| format!("invalid object path segment {segment:?}"))
}
