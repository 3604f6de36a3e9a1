//! Path resolution over the node tree.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tangofs_db::TangoDatabase;
use tracing::debug;

use crate::config::TangoFsConfig;
use crate::error::{Result, TangoFsError};
use crate::node::{Context, Node, NodeKind};

/// One namespace over one backing store. Owns the root node; everything
/// else is owned by the child caches below it.
pub struct Namespace {
    pub(crate) ctx: Arc<Context>,
    root: Arc<Node>,
    substitute: char,
}

impl Namespace {
    pub fn new(db: Arc<dyn TangoDatabase>, config: &TangoFsConfig) -> Self {
        Self::with_options(
            db,
            config.ttl(),
            config.attribute_debounce(),
            config.slash_substitute,
        )
    }

    pub fn with_options(
        db: Arc<dyn TangoDatabase>,
        ttl: Option<Duration>,
        attribute_debounce: Duration,
        substitute: char,
    ) -> Self {
        let ctx = Arc::new(Context::new(db, ttl, attribute_debounce));
        let root = Node::new_root(ctx.clone());
        Self {
            ctx,
            root,
            substitute,
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn db(&self) -> &Arc<dyn TangoDatabase> {
        &self.ctx.db
    }

    pub fn substitute(&self) -> char {
        self.substitute
    }

    /// Walks `path` from the root. An empty path is the root itself.
    pub fn resolve<S: AsRef<str>>(&self, path: &[S]) -> Result<Arc<Node>> {
        let mut node = self.root.clone();
        for (depth, segment) in path.iter().enumerate() {
            let segment = segment.as_ref();
            if node.is_leaf() {
                return Err(TangoFsError::NotNavigable {
                    path: join(&path[..depth]),
                });
            }
            node = match node.child(segment) {
                Ok(child) => child,
                Err(TangoFsError::NotFound { .. }) => {
                    return Err(TangoFsError::not_found(join(&path[..=depth])))
                }
                Err(e) => return Err(e),
            };
        }
        Ok(node)
    }

    /// Resolves a filesystem path such as `/devices/sys/tg_test/1`.
    pub fn resolve_str(&self, path: &str) -> Result<Arc<Node>> {
        let segments = self.split_path(path);
        debug!("resolve {:?}", segments);
        self.resolve(&segments)
    }

    /// Splits a filesystem path into entity names, turning the substitute
    /// character back into slashes.
    pub fn split_path(&self, path: &str) -> Vec<String> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .map(|s| self.decode_name(s))
            .collect()
    }

    pub fn decode_name(&self, segment: &str) -> String {
        segment.replace(self.substitute, "/")
    }

    /// Entity name as shown in a directory listing.
    pub fn encode_name(&self, name: &str) -> String {
        name.replace('/', &self.substitute.to_string())
    }

    /// Dumps the subtree at `path` down to `depth` levels, for inspection.
    pub fn to_json(&self, path: &str, depth: usize) -> Result<Value> {
        let node = self.resolve_str(path)?;
        node_to_json(&node, depth)
    }
}

fn join<S: AsRef<str>>(path: &[S]) -> String {
    path.iter()
        .map(|s| s.as_ref())
        .collect::<Vec<_>>()
        .join("/")
}

fn node_to_json(node: &Arc<Node>, depth: usize) -> Result<Value> {
    match node.kind() {
        NodeKind::Property(_) => {
            let prop = node.as_property().ok_or_else(|| TangoFsError::not_found(node.name()))?;
            Ok(json!(prop.value()?))
        }
        NodeKind::Attribute(_) => {
            let attr = node.as_attribute().ok_or_else(|| TangoFsError::not_found(node.name()))?;
            let config = attr.config()?;
            Ok(json!({
                "value": attr.field_text("value")?.trim_end(),
                "data_type": config.data_type.to_string(),
                "writable": config.writable.to_string(),
            }))
        }
        NodeKind::Command(_) => {
            let cmd = node.as_command().ok_or_else(|| TangoFsError::not_found(node.name()))?;
            let info = cmd.info()?;
            Ok(json!({
                "in_type": info.in_type.to_string(),
                "out_type": info.out_type.to_string(),
            }))
        }
        _ if depth == 0 => Ok(Value::Object(Map::new())),
        _ => {
            let mut map = Map::new();
            for name in node.list_children()? {
                let child = node.child(&name)?;
                map.insert(name, node_to_json(&child, depth - 1)?);
            }
            Ok(Value::Object(map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangofs_db::{DeviceSpec, MemoryDatabase};

    fn namespace() -> (Arc<MemoryDatabase>, Namespace) {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new("sys/tg_test/1", "TangoTest", "TangoTest/test"));
        db.insert_property("sys/tg_test/1", "Host", &["localhost"]);
        let ns = Namespace::new(db.clone(), &TangoFsConfig::default());
        (db, ns)
    }

    #[test]
    fn test_empty_path_is_root() {
        let (_db, ns) = namespace();
        let empty: [&str; 0] = [];
        assert!(ns.resolve(&empty).unwrap().is_root());
        assert!(ns.resolve_str("/").unwrap().is_root());
    }

    #[test]
    fn test_missing_instance_not_found() {
        let (_db, ns) = namespace();
        match ns.resolve(&["servers", "TangoTest", "instance1"]) {
            Err(TangoFsError::NotFound { path }) => {
                assert_eq!(path, "servers/TangoTest/instance1")
            }
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_path_through_leaf_not_navigable() {
        let (_db, ns) = namespace();
        let err = ns
            .resolve_str("/devices/sys/tg_test/1/properties/Host/extra")
            .unwrap_err();
        assert!(matches!(err, TangoFsError::NotNavigable { .. }));
        assert_eq!(err.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_resolve_str_decodes_substitute() {
        let (_db, ns) = namespace();
        let node = ns
            .resolve_str("/servers/TangoTest/test/TangoTest/sys%tg_test%1/properties/Host")
            .unwrap();
        assert_eq!(node.as_property().unwrap().text().unwrap(), "localhost\n");
    }

    #[test]
    fn test_same_node_within_ttl() {
        let (_db, ns) = namespace();
        let a = ns.resolve_str("/devices/sys/tg_test/1").unwrap();
        let b = ns.resolve_str("/devices/SYS/tg_test/1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_encode_decode_names() {
        let (_db, ns) = namespace();
        assert_eq!(ns.encode_name("sys/tg_test/1"), "sys%tg_test%1");
        assert_eq!(ns.split_path("a/b%c/"), vec!["a", "b/c"]);
    }

    #[test]
    fn test_to_json_dumps_subtree() {
        let (_db, ns) = namespace();
        let value = ns.to_json("/devices/sys/tg_test/1", 3).unwrap();
        assert_eq!(value["properties"]["Host"], json!(["localhost"]));
        assert!(value["attributes"].is_object());
    }

    #[test]
    fn test_namespaces_do_not_share_state() {
        let (db, a) = namespace();
        let b = Namespace::new(db.clone(), &TangoFsConfig::default());
        let x = a.resolve_str("/servers").unwrap();
        let y = b.resolve_str("/servers").unwrap();
        assert!(!Arc::ptr_eq(&x, &y));
    }
}
