//! Structural mutations.
//!
//! Each mutation issues the backing-store call(s) and then invalidates only
//! the collections whose listing changed, in both trees: entities touched
//! through one tree get their generation bumped so the copies cached under
//! the other tree refetch. Renames are add-then-delete: when
//! the delete fails both names stay visible and the caller gets
//! [`TangoFsError::PartialRename`].

use tangofs_db::DeviceSpec;
use tracing::{debug, warn};

use crate::error::{Result, TangoFsError};
use crate::namespace::Namespace;
use crate::node::{Node, NodeKind, Scope, DEVICES, SERVERS};

impl Node {
    fn invalid(&self, op: &str) -> TangoFsError {
        TangoFsError::invalid_operation(op, self.path().join("/"))
    }

    fn properties_device(&self, op: &str) -> Result<&str> {
        match self.kind() {
            NodeKind::Properties { device } => Ok(device),
            _ => Err(self.invalid(op)),
        }
    }

    fn server_instance(&self, instance: &str, op: &str) -> Result<String> {
        match self.kind() {
            NodeKind::Server => Ok(format!("{}/{}", self.name(), instance)),
            _ => Err(self.invalid(op)),
        }
    }

    /// Creates or overwrites properties of the device.
    pub fn add_properties(&self, properties: &[(String, Vec<String>)]) -> Result<()> {
        let device = self.properties_device("add_property")?;
        for (name, value) in properties {
            self.context().db.put_property(device, name, value)?;
            self.property_changed(device, name);
            debug!("added property {}/{}", device, name);
        }
        self.invalidate();
        Ok(())
    }

    /// Drops the cached value of one property here and in the other tree.
    fn property_changed(&self, device: &str, name: &str) {
        let ctx = self.context();
        ctx.bump(Scope::Property(device, name));
        ctx.bump(Scope::PropertyNames(device));
        if let Some(existing) = self.materialized_child(name) {
            existing.invalidate();
        }
    }

    pub fn delete_property(&self, name: &str) -> Result<()> {
        let device = self.properties_device("delete_property")?;
        self.context().db.delete_property(device, name)?;
        self.property_changed(device, name);
        self.evict(name);
        debug!("deleted property {}/{}", device, name);
        self.invalidate();
        Ok(())
    }

    pub fn rename_property(&self, from: &str, to: &str) -> Result<()> {
        let device = self.properties_device("rename")?;
        let db = &self.context().db;
        let value = db.get_property(device, from)?;
        db.put_property(device, to, &value)?;
        self.property_changed(device, to);
        self.invalidate();
        if let Err(source) = db.delete_property(device, from) {
            warn!("rename {} -> {} on {}: old property left behind", from, to, device);
            return Err(TangoFsError::PartialRename {
                from: from.to_string(),
                to: to.to_string(),
                source,
            });
        }
        self.property_changed(device, from);
        self.evict(from);
        debug!("renamed property {}/{} to {}", device, from, to);
        Ok(())
    }

    /// Removes an instance of this server. Instances that still serve a
    /// class cannot be removed.
    pub fn delete_instance(&self, instance: &str) -> Result<()> {
        let server_instance = self.server_instance(instance, "rmdir")?;
        let classes = self.context().db.server_class_names(&server_instance)?;
        if !classes.is_empty() {
            return Err(TangoFsError::invalid_operation("rmdir", server_instance));
        }
        self.context().db.delete_server(&server_instance)?;
        debug!("deleted server {}", server_instance);
        self.invalidate();
        Ok(())
    }

    /// Moves every device of `from` to a new instance `to`, then removes
    /// the old instance.
    pub fn rename_instance(&self, from: &str, to: &str) -> Result<()> {
        let old = self.server_instance(from, "rename")?;
        let new = self.server_instance(to, "rename")?;
        let db = &self.context().db;
        let mut devices = Vec::new();
        for class in db.server_class_names(&old)? {
            for device in db.device_names(&old, &class)? {
                devices.push(DeviceSpec::new(device, class.clone(), new.clone()));
            }
        }
        db.add_server(&new, &devices)?;
        for spec in &devices {
            self.context().bump(Scope::Device(&spec.name));
        }
        self.invalidate();
        if let Err(source) = db.delete_server(&old) {
            warn!("rename {} -> {}: old instance left behind", old, new);
            return Err(TangoFsError::PartialRename {
                from: old,
                to: new,
                source,
            });
        }
        debug!("renamed server {} to {} ({} devices)", old, new, devices.len());
        Ok(())
    }

    /// Unregisters a device listed by this class or family. The listing
    /// holding the device in the other tree is invalidated as well.
    pub fn delete_device(&self, name: &str) -> Result<()> {
        let device = match self.kind() {
            NodeKind::Class { .. } => name.to_string(),
            NodeKind::Family { domain } => format!("{}/{}/{}", domain, self.name(), name),
            _ => return Err(self.invalid("rmdir")),
        };
        let ctx = self.context();
        let info = ctx.db.device_info(&device).ok();
        ctx.db.delete_device(&device)?;
        debug!("deleted device {}", device);
        ctx.bump(Scope::Device(&device));
        self.invalidate();

        if let Some(root) = ctx.root() {
            if let Some((exe, inst)) = info.as_ref().and_then(|i| i.server_parts()) {
                let class = info.as_ref().map_or("", |i| i.class_name.as_str());
                invalidate_deepest_materialized(&root, &[SERVERS, exe, inst, class]);
            }
            let segments: Vec<&str> = device.split('/').collect();
            if segments.len() == 3 {
                invalidate_deepest_materialized(&root, &[DEVICES, segments[0], segments[1]]);
            }
        }
        Ok(())
    }
}

/// Invalidates the deepest already materialized node along `chain` below
/// `root`. Nothing is fetched: a listing never built cannot be stale.
fn invalidate_deepest_materialized(root: &Node, chain: &[&str]) {
    let Some(mut node) = root.materialized_child(chain[0]) else {
        return;
    };
    for segment in &chain[1..] {
        match node.materialized_child(segment) {
            Some(child) => node = child,
            None => break,
        }
    }
    debug!("invalidating {}", node.path().join("/"));
    node.invalidate();
}

impl Namespace {
    /// Registers `device` of `class` in `server/instance`, creating the
    /// instance when it does not exist yet.
    pub fn create_device(
        &self,
        server: &str,
        instance: &str,
        class: &str,
        device: &str,
    ) -> Result<()> {
        let server_instance = format!("{}/{}", server, instance);
        let spec = DeviceSpec::new(device, class, server_instance.clone());
        let instance_exists = match self.resolve(&[SERVERS, server, instance]) {
            Ok(_) => true,
            Err(TangoFsError::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if instance_exists {
            self.db().add_device(&spec)?;
        } else {
            self.db().add_server(&server_instance, &[spec])?;
        }
        debug!("created device {} in {} ({})", device, server_instance, class);
        self.ctx.bump(Scope::Device(device));

        self.invalidate_nearest(&[SERVERS, server, instance, class]);
        let segments: Vec<&str> = device.split('/').collect();
        if segments.len() == 3 {
            self.invalidate_nearest(&[DEVICES, segments[0], segments[1]]);
        }
        Ok(())
    }

    /// Invalidates the deepest node of `chain` that currently resolves.
    fn invalidate_nearest(&self, chain: &[&str]) {
        for depth in (1..=chain.len()).rev() {
            if let Ok(node) = self.resolve(&chain[..depth]) {
                debug!("invalidating {}", chain[..depth].join("/"));
                node.invalidate();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tangofs_db::{DbError, MemoryDatabase, TangoDatabase};

    fn fixture() -> (Arc<MemoryDatabase>, Namespace) {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new("sys/tg_test/1", "TangoTest", "TangoTest/test"));
        db.insert_property("sys/tg_test/1", "Host", &["localhost"]);
        db.add_server("Empty/inst", &[]).unwrap();
        let ns = Namespace::with_options(db.clone(), None, Duration::ZERO, '%');
        db.reset_calls();
        (db, ns)
    }

    fn props(ns: &Namespace) -> Arc<Node> {
        ns.resolve(&["devices", "sys", "tg_test", "1", "properties"])
            .unwrap()
    }

    #[test]
    fn test_add_property_listed() {
        let (_db, ns) = fixture();
        let props = props(&ns);
        assert_eq!(props.list_children().unwrap(), vec!["Host"]);
        props
            .add_properties(&[("Port".to_string(), vec!["10000".to_string()])])
            .unwrap();
        assert_eq!(props.list_children().unwrap(), vec!["Host", "Port"]);
    }

    #[test]
    fn test_delete_property() {
        let (db, ns) = fixture();
        let props = props(&ns);
        props.delete_property("Host").unwrap();
        assert!(props.list_children().unwrap().is_empty());
        assert_eq!(db.count_of("delete_property"), 1);
    }

    #[test]
    fn test_rename_property_keeps_value() {
        let (_db, ns) = fixture();
        let props = props(&ns);
        props.rename_property("Host", "Hostname").unwrap();
        assert_eq!(props.list_children().unwrap(), vec!["Hostname"]);
        let node = props.child("Hostname").unwrap();
        assert_eq!(node.as_property().unwrap().text().unwrap(), "localhost\n");
    }

    #[test]
    fn test_rename_onto_cached_property_serves_new_value() {
        let (db, ns) = fixture();
        db.insert_property("sys/tg_test/1", "Hostname", &["old"]);
        let props = props(&ns);
        props.invalidate();
        let target = props.child("Hostname").unwrap();
        assert_eq!(target.as_property().unwrap().text().unwrap(), "old\n");

        props.rename_property("Host", "Hostname").unwrap();

        assert_eq!(target.as_property().unwrap().text().unwrap(), "localhost\n");
        let fresh = props.child("Hostname").unwrap();
        assert_eq!(fresh.as_property().unwrap().text().unwrap(), "localhost\n");
        assert!(props.materialized_child("Host").is_none());
        assert_eq!(props.list_children().unwrap(), vec!["Hostname"]);
    }

    #[test]
    fn test_property_write_seen_through_other_tree() {
        let (_db, ns) = fixture();
        let via_servers = ns
            .resolve(&[
                "servers",
                "TangoTest",
                "test",
                "TangoTest",
                "sys/tg_test/1",
                "properties",
            ])
            .unwrap();
        let host = via_servers.child("Host").unwrap();
        assert_eq!(host.as_property().unwrap().text().unwrap(), "localhost\n");
        assert_eq!(via_servers.list_children().unwrap(), vec!["Host"]);

        let via_devices = props(&ns);
        via_devices
            .child("Host")
            .unwrap()
            .as_property()
            .unwrap()
            .set_text("newhost\n")
            .unwrap();
        via_devices
            .add_properties(&[("Port".to_string(), vec!["10000".to_string()])])
            .unwrap();

        assert_eq!(host.as_property().unwrap().text().unwrap(), "newhost\n");
        assert_eq!(via_servers.list_children().unwrap(), vec!["Host", "Port"]);

        via_devices.delete_property("Port").unwrap();
        assert_eq!(via_servers.list_children().unwrap(), vec!["Host"]);
    }

    #[test]
    fn test_rename_property_partial_failure_reported() {
        let (db, ns) = fixture();
        let props = props(&ns);
        db.inject_timeout("delete_property");
        match props.rename_property("Host", "Hostname") {
            Err(TangoFsError::PartialRename { from, to, source }) => {
                assert_eq!(from, "Host");
                assert_eq!(to, "Hostname");
                assert!(source.is_timeout());
            }
            other => panic!("expected PartialRename, got {:?}", other),
        }
        db.clear_faults();
        assert_eq!(props.list_children().unwrap(), vec!["Host", "Hostname"]);
    }

    #[test]
    fn test_property_mutation_on_wrong_node() {
        let (_db, ns) = fixture();
        let servers = ns.resolve(&["servers"]).unwrap();
        assert!(matches!(
            servers.delete_property("Host"),
            Err(TangoFsError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_delete_instance_requires_empty() {
        let (db, ns) = fixture();
        let server = ns.resolve(&["servers", "TangoTest"]).unwrap();
        assert!(matches!(
            server.delete_instance("test"),
            Err(TangoFsError::InvalidOperation { .. })
        ));
        assert_eq!(db.count_of("delete_server"), 0);

        let empty = ns.resolve(&["servers", "Empty"]).unwrap();
        assert_eq!(empty.list_children().unwrap(), vec!["inst"]);
        empty.delete_instance("inst").unwrap();
        assert!(ns.resolve(&["servers", "Empty", "inst"]).is_err());
    }

    #[test]
    fn test_rename_instance_moves_devices() {
        let (db, ns) = fixture();
        let server = ns.resolve(&["servers", "TangoTest"]).unwrap();
        server.rename_instance("test", "prod").unwrap();
        assert_eq!(server.list_children().unwrap(), vec!["prod"]);
        assert_eq!(
            db.device_info("sys/tg_test/1").unwrap().server,
            "TangoTest/prod"
        );
    }

    #[test]
    fn test_delete_device_from_family() {
        let (db, ns) = fixture();
        let family = ns.resolve(&["devices", "sys", "tg_test"]).unwrap();
        family.delete_device("1").unwrap();
        assert!(family.list_children().unwrap().is_empty());
        assert!(matches!(
            db.device_info("sys/tg_test/1"),
            Err(DbError::DevFailed { .. })
        ));
    }

    #[test]
    fn test_delete_device_invalidates_class_listing() {
        let (db, ns) = fixture();
        let class = ns
            .resolve(&["servers", "TangoTest", "test", "TangoTest"])
            .unwrap();
        assert_eq!(class.list_children().unwrap(), vec!["sys/tg_test/1"]);
        let device = class.child("sys/tg_test/1").unwrap();
        assert_eq!(device.device_info().unwrap().unwrap().class_name, "TangoTest");

        let family = ns.resolve(&["devices", "sys", "tg_test"]).unwrap();
        family.delete_device("1").unwrap();

        assert!(class.list_children().unwrap().is_empty());
        assert!(device.device_info().is_err());
        assert_eq!(db.count_of("delete_device"), 1);
    }

    #[test]
    fn test_delete_device_from_class_invalidates_family() {
        let (_db, ns) = fixture();
        let family = ns.resolve(&["devices", "sys", "tg_test"]).unwrap();
        assert_eq!(family.list_children().unwrap(), vec!["1"]);
        let class = ns
            .resolve(&["servers", "TangoTest", "test", "TangoTest"])
            .unwrap();
        class.delete_device("sys/tg_test/1").unwrap();
        assert!(family.list_children().unwrap().is_empty());
    }

    #[test]
    fn test_create_device_in_new_instance() {
        let (db, ns) = fixture();
        let server = ns.resolve(&["servers", "TangoTest"]).unwrap();
        assert_eq!(server.list_children().unwrap(), vec!["test"]);

        ns.create_device("TangoTest", "two", "TangoTest", "sys/tg_test/2")
            .unwrap();

        assert_eq!(db.count_of("add_server"), 1);
        assert_eq!(server.list_children().unwrap(), vec!["test", "two"]);
        let class = ns
            .resolve(&["servers", "TangoTest", "two", "TangoTest"])
            .unwrap();
        assert_eq!(class.list_children().unwrap(), vec!["sys/tg_test/2"]);
    }

    #[test]
    fn test_create_device_in_existing_class() {
        let (db, ns) = fixture();
        let class = ns
            .resolve(&["servers", "TangoTest", "test", "TangoTest"])
            .unwrap();
        let family = ns.resolve(&["devices", "sys", "tg_test"]).unwrap();
        family.list_children().unwrap();

        ns.create_device("TangoTest", "test", "TangoTest", "sys/tg_test/3")
            .unwrap();

        assert_eq!(db.count_of("add_device"), 1);
        assert_eq!(
            class.list_children().unwrap(),
            vec!["sys/tg_test/1", "sys/tg_test/3"]
        );
        assert_eq!(family.list_children().unwrap(), vec!["1", "3"]);
    }
}
