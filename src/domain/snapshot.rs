//! Remote Object Snapshot
//!
//! A live mirror of the objects the Bluetooth daemon currently exposes,
//! keyed by object path. It is written only from watcher events and read by
//! everyone else; replaying the same event sequence always yields the same
//! snapshot.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

/// `OwnedObjectPath` does not implement `Ord` (only `ObjectPath` does), so
/// this wrapper delegates comparison to the inner `ObjectPath` to keep the
/// map usable as an ordered key.
#[derive(Debug, PartialEq, Eq)]
struct PathKey(OwnedObjectPath);

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self.0).cmp(&*other.0)
    }
}

impl Borrow<ObjectPath<'static>> for PathKey {
    fn borrow(&self) -> &ObjectPath<'static> {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct RemoteObjectSnapshot {
    // BTreeMap so "first object implementing X" is deterministic.
    objects: BTreeMap<PathKey, BTreeSet<String>>,
}

impl RemoteObjectSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot with an initial enumeration.
    pub fn reset<I>(&mut self, objects: I)
    where
        I: IntoIterator<Item = (OwnedObjectPath, Vec<String>)>,
    {
        self.objects.clear();
        for (path, interfaces) in objects {
            self.add(path, interfaces);
        }
    }

    /// Merge interfaces into the entry at `path`, creating it if needed.
    /// Re-adding an interface that is already present is a no-op.
    pub fn add(&mut self, path: OwnedObjectPath, interfaces: Vec<String>) {
        self.objects.entry(PathKey(path)).or_default().extend(interfaces);
    }

    /// Remove interfaces from the entry at `path`. An empty interface list
    /// removes the whole entry, as does removing its last interface.
    pub fn remove(&mut self, path: &OwnedObjectPath, interfaces: &[String]) {
        if interfaces.is_empty() {
            self.objects.remove(&**path);
            return;
        }
        if let Some(existing) = self.objects.get_mut(&**path) {
            for interface in interfaces {
                existing.remove(interface);
            }
            if existing.is_empty() {
                self.objects.remove(&**path);
            }
        }
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    /// First object (in path order) implementing `interface`.
    pub fn first_with_interface(&self, interface: &str) -> Option<&OwnedObjectPath> {
        self.objects
            .iter()
            .find(|(_, interfaces)| interfaces.contains(interface))
            .map(|(path, _)| &path.0)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(s).unwrap()
    }

    fn ifaces(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn replay_matches_event_sequence() {
        let mut snapshot = RemoteObjectSnapshot::new();
        snapshot.add(path("/org/bluez/hci0"), ifaces(&["org.bluez.Adapter1"]));
        snapshot.add(
            path("/org/bluez/hci0/dev_AA"),
            ifaces(&["org.bluez.Device1"]),
        );
        snapshot.remove(&path("/org/bluez/hci0/dev_AA"), &ifaces(&["org.bluez.Device1"]));

        assert_eq!(
            snapshot.first_with_interface("org.bluez.Adapter1"),
            Some(&path("/org/bluez/hci0"))
        );
        assert_eq!(snapshot.first_with_interface("org.bluez.Device1"), None);
    }

    #[test]
    fn add_remove_add_same_path_is_idempotent() {
        let mut snapshot = RemoteObjectSnapshot::new();
        let p = path("/org/bluez/hci0");

        snapshot.add(p.clone(), ifaces(&["org.bluez.Adapter1"]));
        snapshot.remove(&p, &ifaces(&["org.bluez.Adapter1"]));
        assert_eq!(snapshot.first_with_interface("org.bluez.Adapter1"), None);

        snapshot.add(p.clone(), ifaces(&["org.bluez.Adapter1"]));
        snapshot.add(p.clone(), ifaces(&["org.bluez.Adapter1"]));
        assert_eq!(
            snapshot.first_with_interface("org.bluez.Adapter1"),
            Some(&p)
        );
    }

    #[test]
    fn removing_last_interface_drops_the_object() {
        let mut snapshot = RemoteObjectSnapshot::new();
        let p = path("/org/bluez/hci0");
        snapshot.add(
            p.clone(),
            ifaces(&["org.bluez.Adapter1", "org.bluez.GattManager1"]),
        );

        snapshot.remove(&p, &ifaces(&["org.bluez.Adapter1"]));
        assert_eq!(
            snapshot.first_with_interface("org.bluez.GattManager1"),
            Some(&p)
        );

        snapshot.remove(&p, &ifaces(&["org.bluez.GattManager1"]));
        assert_eq!(snapshot.first_with_interface("org.bluez.GattManager1"), None);
    }

    #[test]
    fn first_with_interface_is_path_ordered() {
        let mut snapshot = RemoteObjectSnapshot::new();
        snapshot.add(path("/org/bluez/hci1"), ifaces(&["org.bluez.Adapter1"]));
        snapshot.add(path("/org/bluez/hci0"), ifaces(&["org.bluez.Adapter1"]));

        assert_eq!(
            snapshot.first_with_interface("org.bluez.Adapter1"),
            Some(&path("/org/bluez/hci0"))
        );
    }

    #[test]
    fn empty_interface_list_removes_whole_object() {
        let mut snapshot = RemoteObjectSnapshot::new();
        let p = path("/org/bluez/hci0");
        snapshot.add(
            p.clone(),
            ifaces(&["org.bluez.Adapter1", "org.bluez.GattManager1"]),
        );
        snapshot.remove(&p, &[]);
        assert_eq!(snapshot.first_with_interface("org.bluez.Adapter1"), None);
        assert_eq!(snapshot.first_with_interface("org.bluez.GattManager1"), None);
    }
}
