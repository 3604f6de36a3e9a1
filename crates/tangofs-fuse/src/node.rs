//! Namespace nodes.
//!
//! Every position in the tree is a [`Node`]: a name, a non-owning link to its
//! parent, a [`ChildCache`] owning the materialized children, and a
//! [`NodeKind`] that decides how children are enumerated and built. Nodes are
//! created lazily the first time their name is looked up.
//!
//! Lock discipline: a node only ever locks its own mutexes, and never calls
//! the backing store or another node while holding its child cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tangofs_db::{AttributeConfig, CommandInfo, DeviceInfo, DispLevel, TangoDatabase};
use tracing::{debug, warn};

use crate::cache::{CacheStats, ChildCache, Lookup};
use crate::error::{Result, TangoFsError};
use crate::leaf::{Attribute, AttributeLeaf, Command, CommandLeaf, Property, PropertyLeaf};

pub const SERVERS: &str = "servers";
pub const DEVICES: &str = "devices";
pub const PROPERTIES: &str = "properties";
pub const ATTRIBUTES: &str = "attributes";
pub const COMMANDS: &str = "commands";

/// Recovers the guard of a poisoned lock. The guarded caches stay
/// structurally valid whatever the panicking thread was doing.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Backing-store entity whose cached copies must agree across both trees.
///
/// A device is materialized once under `servers` and once under `devices`,
/// so its cached state lives in two nodes. Writes bump the generation of
/// the entity; a cached copy taken under an older generation is stale.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Registration of a device.
    Device(&'a str),
    /// The property names of a device.
    PropertyNames(&'a str),
    /// Value and history of one property.
    Property(&'a str, &'a str),
}

impl Scope<'_> {
    fn key(&self) -> String {
        match self {
            Scope::Device(device) => format!("d:{}", device.to_lowercase()),
            Scope::PropertyNames(device) => format!("n:{}", device.to_lowercase()),
            Scope::Property(device, name) => format!("p:{}/{}", device.to_lowercase(), name),
        }
    }
}

/// State shared by every node of one namespace.
pub struct Context {
    pub db: Arc<dyn TangoDatabase>,
    pub ttl: Option<Duration>,
    pub attribute_debounce: Duration,
    generations: DashMap<String, u64>,
    root: OnceLock<Weak<Node>>,
}

impl Context {
    pub fn new(
        db: Arc<dyn TangoDatabase>,
        ttl: Option<Duration>,
        attribute_debounce: Duration,
    ) -> Self {
        Self {
            db,
            ttl,
            attribute_debounce,
            generations: DashMap::new(),
            root: OnceLock::new(),
        }
    }

    /// Current generation of `scope`; zero until it is first changed.
    pub fn generation(&self, scope: Scope<'_>) -> u64 {
        self.generations.get(&scope.key()).map_or(0, |g| *g)
    }

    /// Marks every cached copy of `scope` as stale.
    pub fn bump(&self, scope: Scope<'_>) {
        *self.generations.entry(scope.key()).or_insert(0) += 1;
    }

    pub(crate) fn set_root(&self, root: &Arc<Node>) {
        let _ = self.root.set(Arc::downgrade(root));
    }

    pub(crate) fn root(&self) -> Option<Arc<Node>> {
        self.root.get().and_then(Weak::upgrade)
    }
}

#[derive(Debug)]
pub struct DeviceState {
    /// Full `domain/family/member` name.
    pub device: String,
    info: Mutex<Option<(u64, DeviceInfo)>>,
}

impl DeviceState {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            info: Mutex::new(None),
        }
    }
}

pub enum NodeKind {
    Root,
    Servers,
    /// Named after the server executable.
    Server,
    Instance {
        server: String,
    },
    Class {
        server_instance: String,
    },
    Domains,
    Domain,
    Family {
        domain: String,
    },
    Device(DeviceState),
    Properties {
        device: String,
    },
    Attributes {
        device: String,
        /// Configurations fetched with the last enumeration, keyed by
        /// lowercase attribute name.
        configs: Mutex<HashMap<String, AttributeConfig>>,
    },
    Commands {
        device: String,
        infos: Mutex<HashMap<String, CommandInfo>>,
    },
    Property(PropertyLeaf),
    Attribute(AttributeLeaf),
    Command(CommandLeaf),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::Servers => "servers",
            NodeKind::Server => "server",
            NodeKind::Instance { .. } => "instance",
            NodeKind::Class { .. } => "class",
            NodeKind::Domains => "domains",
            NodeKind::Domain => "domain",
            NodeKind::Family { .. } => "family",
            NodeKind::Device(_) => "device",
            NodeKind::Properties { .. } => "properties",
            NodeKind::Attributes { .. } => "attributes",
            NodeKind::Commands { .. } => "commands",
            NodeKind::Property(_) => "property",
            NodeKind::Attribute(_) => "attribute",
            NodeKind::Command(_) => "command",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            NodeKind::Property(_) | NodeKind::Attribute(_) | NodeKind::Command(_)
        )
    }

    /// Collections whose member names compare case-insensitively.
    fn case_insensitive(&self) -> bool {
        matches!(
            self,
            NodeKind::Class { .. }
                | NodeKind::Domains
                | NodeKind::Domain
                | NodeKind::Family { .. }
                | NodeKind::Attributes { .. }
                | NodeKind::Commands { .. }
        )
    }
}

pub struct Node {
    name: String,
    parent: Weak<Node>,
    kind: NodeKind,
    children: Mutex<ChildCache<Arc<Node>>>,
    ctx: Arc<Context>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .finish()
    }
}

impl Node {
    pub(crate) fn new_root(ctx: Arc<Context>) -> Arc<Node> {
        let root = Arc::new(Node::new(String::new(), Weak::new(), NodeKind::Root, ctx));
        root.ctx.set_root(&root);
        root
    }

    fn new(name: String, parent: Weak<Node>, kind: NodeKind, ctx: Arc<Context>) -> Node {
        let cache = ChildCache::new(ctx.ttl, kind.case_insensitive());
        Node {
            name,
            parent,
            kind,
            children: Mutex::new(cache),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.kind.is_leaf()
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root)
    }

    pub(crate) fn context(&self) -> &Context {
        &self.ctx
    }

    /// Full device name for device nodes and everything below them.
    pub fn device_name(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Device(state) => Some(&state.device),
            NodeKind::Properties { device }
            | NodeKind::Attributes { device, .. }
            | NodeKind::Commands { device, .. } => Some(device),
            NodeKind::Property(leaf) => Some(leaf.device()),
            NodeKind::Attribute(leaf) => Some(leaf.device()),
            NodeKind::Command(leaf) => Some(leaf.device()),
            _ => None,
        }
    }

    pub fn as_property(&self) -> Option<Property<'_>> {
        match &self.kind {
            NodeKind::Property(leaf) => Some(Property { node: self, leaf }),
            _ => None,
        }
    }

    pub fn as_attribute(&self) -> Option<Attribute<'_>> {
        match &self.kind {
            NodeKind::Attribute(leaf) => Some(Attribute { node: self, leaf }),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<Command<'_>> {
        match &self.kind {
            NodeKind::Command(leaf) => Some(Command { node: self, leaf }),
            _ => None,
        }
    }

    /// Registration data of a device node, fetched once.
    pub fn device_info(&self) -> Result<Option<DeviceInfo>> {
        let NodeKind::Device(state) = &self.kind else {
            return Ok(None);
        };
        let generation = self.ctx.generation(Scope::Device(&state.device));
        if let Some((seen, info)) = lock(&state.info).as_ref() {
            if *seen == generation {
                return Ok(Some(info.clone()));
            }
        }
        let info = self.ctx.db.device_info(&state.device)?;
        *lock(&state.info) = Some((generation, info.clone()));
        Ok(Some(info))
    }

    fn not_navigable(&self) -> TangoFsError {
        TangoFsError::NotNavigable {
            path: self.path().join("/"),
        }
    }

    /// Scope whose changes outdate this node's enumeration.
    fn listing_scope(&self) -> Option<Scope<'_>> {
        match &self.kind {
            NodeKind::Device(state) => Some(Scope::Device(&state.device)),
            NodeKind::Properties { device } => Some(Scope::PropertyNames(device)),
            _ => None,
        }
    }

    fn listing_generation(&self) -> u64 {
        self.listing_scope()
            .map_or(0, |scope| self.ctx.generation(scope))
    }

    /// True when the child enumeration was fetched, has not expired and no
    /// write went through the other tree since.
    pub fn is_fresh(&self) -> bool {
        let generation = self.listing_generation();
        let cache = lock(&self.children);
        cache.is_fresh() && cache.generation() == generation
    }

    /// Asks the backing store for the current child names.
    fn fetch_names(&self) -> Result<Vec<String>> {
        let db = &self.ctx.db;
        let names = match &self.kind {
            NodeKind::Root => vec![SERVERS.to_string(), DEVICES.to_string()],
            NodeKind::Servers => db.server_names()?,
            NodeKind::Server => db.instance_names(&self.name)?,
            NodeKind::Instance { server } => {
                db.server_class_names(&format!("{}/{}", server, self.name))?
            }
            NodeKind::Class { server_instance } => {
                lowercase(db.device_names(server_instance, &self.name)?)
            }
            NodeKind::Domains => lowercase(db.domain_names()?),
            NodeKind::Domain => lowercase(db.family_names(&self.name)?),
            NodeKind::Family { domain } => lowercase(db.member_names(domain, &self.name)?),
            NodeKind::Device(state) => {
                let mut names = vec![PROPERTIES.to_string()];
                match db.ping(&state.device) {
                    Ok(_) => {
                        names.push(ATTRIBUTES.to_string());
                        names.push(COMMANDS.to_string());
                    }
                    Err(e) => debug!("device {} not reachable: {}", state.device, e),
                }
                names
            }
            NodeKind::Properties { device } => db.property_names(device)?,
            NodeKind::Attributes { device, configs } => {
                match fetch_attributes(db.as_ref(), device) {
                    Ok(found) => {
                        let names = found.iter().map(listed_attribute_name).collect();
                        *lock(configs) = found
                            .into_iter()
                            .map(|c| (c.name.to_lowercase(), c))
                            .collect();
                        names
                    }
                    Err(e) => {
                        warn!("listing attributes of {} failed: {}", device, e);
                        Vec::new()
                    }
                }
            }
            NodeKind::Commands { device, infos } => match db.command_list(device) {
                Ok(found) => {
                    let names = found.iter().map(|c| c.name.clone()).collect();
                    *lock(infos) = found
                        .into_iter()
                        .map(|c| (c.name.to_lowercase(), c))
                        .collect();
                    names
                }
                Err(e) => {
                    warn!("listing commands of {} failed: {}", device, e);
                    Vec::new()
                }
            },
            NodeKind::Property(_) | NodeKind::Attribute(_) | NodeKind::Command(_) => {
                return Err(self.not_navigable())
            }
        };
        Ok(names)
    }

    /// Builds the child called `name`. Never touches the backing store.
    fn make_child(self: &Arc<Self>, name: &str) -> Result<Node> {
        let kind = match &self.kind {
            NodeKind::Root if name == SERVERS => NodeKind::Servers,
            NodeKind::Root => NodeKind::Domains,
            NodeKind::Servers => NodeKind::Server,
            NodeKind::Server => NodeKind::Instance {
                server: self.name.clone(),
            },
            NodeKind::Instance { server } => NodeKind::Class {
                server_instance: format!("{}/{}", server, self.name),
            },
            NodeKind::Class { .. } => NodeKind::Device(DeviceState::new(name)),
            NodeKind::Domains => NodeKind::Domain,
            NodeKind::Domain => NodeKind::Family {
                domain: self.name.clone(),
            },
            NodeKind::Family { domain } => {
                NodeKind::Device(DeviceState::new(format!("{}/{}/{}", domain, self.name, name)))
            }
            NodeKind::Device(state) => {
                let device = state.device.clone();
                match name {
                    ATTRIBUTES => NodeKind::Attributes {
                        device,
                        configs: Mutex::new(HashMap::new()),
                    },
                    COMMANDS => NodeKind::Commands {
                        device,
                        infos: Mutex::new(HashMap::new()),
                    },
                    _ => NodeKind::Properties { device },
                }
            }
            NodeKind::Properties { device } => NodeKind::Property(PropertyLeaf::new(device.clone())),
            NodeKind::Attributes { device, configs } => {
                let attr = name.strip_prefix('.').unwrap_or(name);
                let config = lock(configs).get(&attr.to_lowercase()).cloned();
                let attr = config.as_ref().map(|c| c.name.clone()).unwrap_or_else(|| attr.to_string());
                NodeKind::Attribute(AttributeLeaf::new(device.clone(), attr, config))
            }
            NodeKind::Commands { device, infos } => {
                let info = lock(infos).get(&name.to_lowercase()).cloned();
                NodeKind::Command(CommandLeaf::new(device.clone(), info))
            }
            NodeKind::Property(_) | NodeKind::Attribute(_) | NodeKind::Command(_) => {
                return Err(self.not_navigable())
            }
        };
        Ok(Node::new(
            name.to_string(),
            Arc::downgrade(self),
            kind,
            self.ctx.clone(),
        ))
    }

    /// Fetches the child names and installs them, keeping surviving
    /// materialized children.
    pub fn refresh_names(&self) -> Result<()> {
        let generation = self.listing_generation();
        let names = self.fetch_names()?;
        let count = names.len();
        let dropped = {
            let mut cache = lock(&self.children);
            let dropped = cache.replace_names(names);
            cache.set_generation(generation);
            dropped
        };
        debug!(
            "refreshed {} '{}': {} children, {} dropped",
            self.kind.label(),
            self.name,
            count,
            dropped
        );
        Ok(())
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.is_leaf() {
            return Err(self.not_navigable());
        }
        if !self.is_fresh() {
            self.refresh_names()?;
        }
        Ok(())
    }

    /// Looks a child up, materializing it on first access.
    pub fn child(self: &Arc<Self>, name: &str) -> Result<Arc<Node>> {
        self.ensure_fresh()?;
        {
            let mut cache = lock(&self.children);
            let mut found = cache.lookup(name);
            if matches!(found, Lookup::Absent) {
                if let Some(alt) = self.alternate_name(name) {
                    found = cache.lookup(&alt);
                }
            }
            match found {
                Lookup::Ready(node) => return Ok(node),
                Lookup::Unmaterialized(spelling) => {
                    let node = Arc::new(self.make_child(&spelling)?);
                    cache.insert_materialized(&spelling, node.clone());
                    debug!("materialized {} '{}'", node.kind.label(), spelling);
                    return Ok(node);
                }
                Lookup::Absent => {}
            }
        }
        let mut path = self.path();
        path.push(name.to_string());
        Err(TangoFsError::not_found(path.join("/")))
    }

    /// Expert attributes are listed with a leading dot but may be looked up
    /// without it, and the other way round.
    fn alternate_name(&self, name: &str) -> Option<String> {
        match &self.kind {
            NodeKind::Attributes { .. } => Some(match name.strip_prefix('.') {
                Some(bare) => bare.to_string(),
                None => format!(".{}", name),
            }),
            _ => None,
        }
    }

    /// Sorted, duplicate-free child names.
    pub fn list_children(&self) -> Result<Vec<String>> {
        self.ensure_fresh()?;
        Ok(lock(&self.children).names_sorted())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.ensure_fresh()?;
        let cache = lock(&self.children);
        Ok(cache.contains(name)
            || self
                .alternate_name(name)
                .is_some_and(|alt| cache.contains(&alt)))
    }

    /// Drops this node's enumeration and cached data; the next access
    /// refetches them.
    pub fn invalidate(&self) {
        lock(&self.children).invalidate();
        match &self.kind {
            NodeKind::Device(state) => *lock(&state.info) = None,
            NodeKind::Property(leaf) => leaf.invalidate(),
            NodeKind::Attribute(leaf) => leaf.invalidate(),
            NodeKind::Command(leaf) => leaf.invalidate(),
            _ => {}
        }
    }

    /// The child called `name` if it was already materialized. Never
    /// refreshes.
    pub fn materialized_child(&self, name: &str) -> Option<Arc<Node>> {
        match lock(&self.children).lookup(name) {
            Lookup::Ready(node) => Some(node),
            _ => None,
        }
    }

    /// Removes one child from the cache, materialized or not.
    pub fn evict(&self, name: &str) -> bool {
        lock(&self.children).remove(name)
    }

    /// Refetches this node now, and with `recurse` every materialized
    /// descendant as well.
    pub fn refresh(&self, recurse: bool) -> Result<()> {
        if self.is_leaf() {
            self.invalidate();
            return Ok(());
        }
        self.refresh_names()?;
        if recurse {
            let children = lock(&self.children).materialized();
            for child in children {
                child.refresh(true)?;
            }
        }
        Ok(())
    }

    pub fn cache_stats(&self) -> CacheStats {
        lock(&self.children).stats()
    }

    /// The parent node. When the parent was evicted while this node was
    /// still held, it is resolved again from the root.
    pub fn parent(&self) -> Result<Option<Arc<Node>>> {
        if self.is_root() {
            return Ok(None);
        }
        if let Some(parent) = self.parent.upgrade() {
            return Ok(Some(parent));
        }
        self.materialize_parent().map(Some)
    }

    fn materialize_parent(&self) -> Result<Arc<Node>> {
        let root = self
            .ctx
            .root()
            .ok_or_else(|| TangoFsError::not_found(self.name.clone()))?;
        let path = self.canonical_parent_path()?;
        debug!("re-resolving parent of '{}' via {:?}", self.name, path);
        let mut node = root;
        for segment in &path {
            node = node.child(segment)?;
        }
        Ok(node)
    }

    /// Path of the parent as reachable from the root, derived from the data
    /// this node carries.
    fn canonical_parent_path(&self) -> Result<Vec<String>> {
        let path = match &self.kind {
            NodeKind::Root => Vec::new(),
            NodeKind::Servers | NodeKind::Domains => Vec::new(),
            NodeKind::Server => vec![SERVERS.to_string()],
            NodeKind::Instance { server } => vec![SERVERS.to_string(), server.clone()],
            NodeKind::Class { server_instance } => {
                let (exe, inst) = server_instance
                    .split_once('/')
                    .unwrap_or((server_instance.as_str(), ""));
                vec![SERVERS.to_string(), exe.to_string(), inst.to_string()]
            }
            NodeKind::Domain => vec![DEVICES.to_string()],
            NodeKind::Family { domain } => vec![DEVICES.to_string(), domain.clone()],
            NodeKind::Device(state) => self.device_class_path(&state.device)?,
            NodeKind::Properties { device }
            | NodeKind::Attributes { device, .. }
            | NodeKind::Commands { device, .. } => {
                let mut path = self.device_class_path(device)?;
                path.push(device.to_lowercase());
                path
            }
            NodeKind::Property(_) | NodeKind::Attribute(_) | NodeKind::Command(_) => {
                let device = self.device_name().unwrap_or_default().to_string();
                let collection = match &self.kind {
                    NodeKind::Property(_) => PROPERTIES,
                    NodeKind::Attribute(_) => ATTRIBUTES,
                    _ => COMMANDS,
                };
                let mut path = self.device_class_path(&device)?;
                path.push(device.to_lowercase());
                path.push(collection.to_string());
                path
            }
        };
        Ok(path)
    }

    /// `servers/<exe>/<instance>/<class>` of a device.
    fn device_class_path(&self, device: &str) -> Result<Vec<String>> {
        let info = self.ctx.db.device_info(device)?;
        let (exe, inst) = info
            .server_parts()
            .ok_or_else(|| TangoFsError::not_found(info.server.clone()))?;
        Ok(vec![
            SERVERS.to_string(),
            exe.to_string(),
            inst.to_string(),
            info.class_name.clone(),
        ])
    }

    /// Segments from the root down to this node.
    pub fn path(&self) -> Vec<String> {
        let mut segments = Vec::new();
        if self.is_root() {
            return segments;
        }
        segments.push(self.name.clone());
        let mut current = self.parent().ok().flatten();
        while let Some(node) = current {
            if node.is_root() {
                break;
            }
            segments.push(node.name.clone());
            current = node.parent().ok().flatten();
        }
        segments.reverse();
        segments
    }
}

fn lowercase(names: Vec<String>) -> Vec<String> {
    names.into_iter().map(|n| n.to_lowercase()).collect()
}

fn fetch_attributes(
    db: &dyn TangoDatabase,
    device: &str,
) -> tangofs_db::DbResult<Vec<AttributeConfig>> {
    let names = db.attribute_names(device)?;
    db.attribute_configs(device, &names)
}

fn listed_attribute_name(config: &AttributeConfig) -> String {
    match config.disp_level {
        DispLevel::Expert => format!(".{}", config.name),
        DispLevel::Operator => config.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use tangofs_db::{AttrValue, DeviceSpec, MemoryDatabase, Scalar};

    const DEV: &str = "sys/tg_test/1";

    fn fixture(ttl: Option<Duration>) -> (Arc<MemoryDatabase>, Namespace) {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new(DEV, "TangoTest", "TangoTest/test"));
        db.insert_device(&DeviceSpec::new("Sys/Database/2", "DataBase", "DataBaseds/2"));
        db.insert_property(DEV, "Host", &["localhost"]);
        db.insert_attribute(
            DEV,
            AttributeConfig::new("ampli"),
            AttrValue::Scalar(Scalar::Float(0.0)),
            None,
        );
        let mut expert = AttributeConfig::new("Secret");
        expert.disp_level = DispLevel::Expert;
        db.insert_attribute(DEV, expert, AttrValue::Scalar(Scalar::Int(1)), None);
        db.insert_command(
            DEV,
            CommandInfo::new("Init", tangofs_db::DataType::Void, tangofs_db::DataType::Void),
            None,
        );
        let ns = Namespace::with_options(db.clone(), ttl, Duration::ZERO, '%');
        (db, ns)
    }

    fn segs(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_root_lists_fixed_children() {
        let (db, ns) = fixture(None);
        assert_eq!(ns.root().list_children().unwrap(), segs(&["devices", "servers"]));
        assert_eq!(db.call_count(), 0);
    }

    #[test]
    fn test_server_hierarchy() {
        let (_db, ns) = fixture(None);
        let inst = ns.resolve(&segs(&["servers", "TangoTest", "test"])).unwrap();
        assert!(matches!(inst.kind(), NodeKind::Instance { server } if server == "TangoTest"));
        assert_eq!(inst.list_children().unwrap(), segs(&["TangoTest"]));
        let class = inst.child("TangoTest").unwrap();
        assert_eq!(class.list_children().unwrap(), segs(&[DEV]));
    }

    #[test]
    fn test_domain_lookup_is_case_insensitive() {
        let (_db, ns) = fixture(None);
        let dev = ns.resolve(&segs(&["devices", "SYS", "TG_Test", "1"])).unwrap();
        assert_eq!(dev.device_name(), Some(DEV));
        assert_eq!(dev.name(), "1");
    }

    #[test]
    fn test_device_children_when_reachable() {
        let (_db, ns) = fixture(None);
        let dev = ns.resolve(&segs(&["devices", "sys", "tg_test", "1"])).unwrap();
        assert_eq!(
            dev.list_children().unwrap(),
            segs(&["attributes", "commands", "properties"])
        );
    }

    #[test]
    fn test_unreachable_device_lists_only_properties() {
        let (db, ns) = fixture(None);
        db.set_exported(DEV, false);
        let dev = ns.resolve(&segs(&["devices", "sys", "tg_test", "1"])).unwrap();
        assert_eq!(dev.list_children().unwrap(), segs(&["properties"]));
        assert!(matches!(
            dev.child("attributes"),
            Err(TangoFsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_expert_attribute_listed_with_dot() {
        let (_db, ns) = fixture(None);
        let attrs = ns
            .resolve(&segs(&["devices", "sys", "tg_test", "1", "attributes"]))
            .unwrap();
        assert_eq!(attrs.list_children().unwrap(), segs(&[".Secret", "ampli"]));
        let a = attrs.child("secret").unwrap();
        let b = attrs.child(".Secret").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_attribute().unwrap().name(), "Secret");
    }

    #[test]
    fn test_attribute_configs_prefetched() {
        let (db, ns) = fixture(None);
        let attr = ns
            .resolve(&segs(&["devices", "sys", "tg_test", "1", "attributes", "ampli"]))
            .unwrap();
        attr.as_attribute().unwrap().config().unwrap();
        assert_eq!(db.count_of("attribute_configs"), 1);
        assert_eq!(db.count_of("attribute_config"), 0);
    }

    #[test]
    fn test_leaf_is_not_navigable() {
        let (_db, ns) = fixture(None);
        let prop = ns
            .resolve(&segs(&["devices", "sys", "tg_test", "1", "properties", "Host"]))
            .unwrap();
        assert!(matches!(
            prop.child("x"),
            Err(TangoFsError::NotNavigable { .. })
        ));
        assert!(prop.list_children().is_err());
    }

    #[test]
    fn test_fresh_miss_does_not_refetch() {
        let (db, ns) = fixture(None);
        let servers = ns.resolve(&segs(&["servers"])).unwrap();
        servers.list_children().unwrap();
        db.reset_calls();
        assert!(servers.child("Nope").is_err());
        assert!(servers.child("Nope").is_err());
        assert_eq!(db.call_count(), 0);
    }

    #[test]
    fn test_invalidate_refetches_and_keeps_children() {
        let (db, ns) = fixture(None);
        let servers = ns.resolve(&segs(&["servers"])).unwrap();
        let first = servers.child("TangoTest").unwrap();
        servers.invalidate();
        let second = servers.child("TangoTest").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(db.count_of("server_names"), 2);
    }

    #[test]
    fn test_ttl_expiry_refetches() {
        let (db, ns) = fixture(Some(Duration::from_millis(0)));
        let servers = ns.resolve(&segs(&["servers"])).unwrap();
        servers.list_children().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        servers.list_children().unwrap();
        assert_eq!(db.count_of("server_names"), 2);
    }

    #[test]
    fn test_refresh_drops_vanished_children() {
        let (db, ns) = fixture(None);
        let servers = ns.resolve(&segs(&["servers"])).unwrap();
        let old = servers.child("DataBaseds").unwrap();
        db.delete_server("DataBaseds/2").unwrap();
        servers.refresh(false).unwrap();
        assert!(!servers.contains("DataBaseds").unwrap());
        // the evicted node can still find its way back while its parent lives
        assert_eq!(old.path(), segs(&["servers", "DataBaseds"]));
    }

    #[test]
    fn test_refresh_recurses_into_materialized() {
        let (db, ns) = fixture(None);
        ns.resolve(&segs(&["servers", "TangoTest", "test"])).unwrap();
        db.reset_calls();
        ns.root().refresh(true).unwrap();
        assert_eq!(db.count_of("server_names"), 1);
        assert_eq!(db.count_of("instance_names"), 1);
        assert_eq!(db.count_of("server_class_names"), 1);
    }

    #[test]
    fn test_path_walks_parents() {
        let (_db, ns) = fixture(None);
        let host = ns
            .resolve(&segs(&[
                "servers",
                "TangoTest",
                "test",
                "TangoTest",
                DEV,
                "properties",
                "Host",
            ]))
            .unwrap();
        assert_eq!(
            host.path(),
            segs(&["servers", "TangoTest", "test", "TangoTest", DEV, "properties", "Host"])
        );
    }

    #[test]
    fn test_orphan_resolves_parent_through_root() {
        let (_db, ns) = fixture(None);
        let props = ns
            .resolve(&segs(&["devices", "sys", "tg_test", "1", "properties"]))
            .unwrap();
        let domain = ns.resolve(&segs(&["devices", "sys"])).unwrap();
        // dropping the device from its family orphans the collection
        assert!(domain.child("tg_test").unwrap().evict("1"));
        let parent = props.parent().unwrap().unwrap();
        assert_eq!(
            parent.path(),
            segs(&["servers", "TangoTest", "test", "TangoTest", DEV])
        );
    }

    #[test]
    fn test_device_info_cached() {
        let (db, ns) = fixture(None);
        let dev = ns.resolve(&segs(&["devices", "sys", "tg_test", "1"])).unwrap();
        let info = dev.device_info().unwrap().unwrap();
        assert_eq!(info.class_name, "TangoTest");
        dev.device_info().unwrap();
        assert_eq!(db.count_of("device_info"), 1);
    }
}
