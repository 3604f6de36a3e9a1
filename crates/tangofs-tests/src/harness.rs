//! Test harness: a small control system with two servers.
//!
//! ```text
//! TangoTest/test   TangoTest   sys/tg_test/1   running, Host property,
//!                                              ampli (rw), double_scalar (ro),
//!                                              expert attribute, Init, DevLong
//!                              sys/tg_test/2   stopped
//! Starter/ctrl01   Starter     tango/admin/ctrl01
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::Context as _;

use tangofs_db::{
    AttrValue, AttrWriteType, AttributeConfig, CommandInfo, DataType, DeviceSpec, DispLevel,
    MemoryDatabase, Scalar,
};
use tangofs_fuse::{Namespace, TangoFs, TangoFsConfig};
use tempfile::TempDir;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const RUNNING: &str = "sys/tg_test/1";
pub const STOPPED: &str = "sys/tg_test/2";
pub const STARTER: &str = "tango/admin/ctrl01";

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test writer. `RUST_LOG` selects the
/// level; nothing is printed by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")),
            )
            .try_init();
    });
}

pub struct TestTango {
    db: Arc<MemoryDatabase>,
    config: TangoFsConfig,
    temp_dir: TempDir,
}

impl TestTango {
    pub fn new() -> Self {
        init_tracing();
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new(RUNNING, "TangoTest", "TangoTest/test"));
        db.insert_device(&DeviceSpec::new(STOPPED, "TangoTest", "TangoTest/test"));
        db.insert_device(&DeviceSpec::new(STARTER, "Starter", "Starter/ctrl01"));
        db.set_exported(STOPPED, false);

        db.insert_property(RUNNING, "Host", &["localhost"]);
        db.insert_property(RUNNING, "polled_attr", &["ampli", "1000"]);
        db.insert_property(STARTER, "StartDsPath", &["/usr/local/bin"]);

        let mut ampli = AttributeConfig::new("ampli");
        ampli.writable = AttrWriteType::ReadWrite;
        ampli.unit = "V".to_string();
        db.insert_attribute(
            RUNNING,
            ampli,
            AttrValue::Scalar(Scalar::Float(0.0)),
            Some(AttrValue::Scalar(Scalar::Float(0.0))),
        );
        db.insert_attribute(
            RUNNING,
            AttributeConfig::new("double_scalar"),
            AttrValue::Scalar(Scalar::Float(3.25)),
            None,
        );
        let mut expert = AttributeConfig::new("no_value");
        expert.disp_level = DispLevel::Expert;
        expert.data_type = DataType::Long;
        db.insert_attribute(RUNNING, expert, AttrValue::Scalar(Scalar::Int(7)), None);

        db.insert_command(
            RUNNING,
            CommandInfo::new("Init", DataType::Void, DataType::Void),
            None,
        );
        db.insert_command(
            RUNNING,
            CommandInfo::new("DevLong", DataType::Long, DataType::Long),
            None,
        );

        let config = TangoFsConfig {
            attribute_debounce_ms: 0,
            ..TangoFsConfig::default()
        };
        debug!("test control system ready");
        Self {
            db,
            config,
            temp_dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.ttl_secs = ttl.map(|d| d.as_secs());
        self
    }

    pub fn with_config(mut self, f: impl FnOnce(&mut TangoFsConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn db(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    pub fn config(&self) -> &TangoFsConfig {
        &self.config
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.db.clone(), &self.config)
    }

    pub fn tangofs(&self) -> TangoFs {
        TangoFs::new(self.db.clone(), self.config.clone())
            .expect("test config is valid")
    }

    /// Scratch directory for snapshot and config files.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Writes `contents` to a scratch file and returns its path.
    pub fn write_scratch(&self, name: &str, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.scratch(name);
        std::fs::write(&path, contents)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Loads a configuration file from the scratch directory and uses it.
    pub fn with_config_file(mut self, name: &str, contents: &str) -> anyhow::Result<Self> {
        let path = self.write_scratch(name, contents)?;
        self.config = TangoFsConfig::from_file(&path)?;
        Ok(self)
    }
}

impl Default for TestTango {
    fn default() -> Self {
        Self::new()
    }
}

/// Properties directory of a device under `servers`.
pub fn server_properties(device: &str) -> String {
    let class = if device == STARTER { "Starter" } else { "TangoTest" };
    let instance = if device == STARTER {
        "Starter/ctrl01"
    } else {
        "TangoTest/test"
    };
    format!(
        "/servers/{}/{}/{}/properties",
        instance,
        class,
        device.replace('/', "%")
    )
}

/// Path of a device under `devices`.
pub fn device_path(device: &str) -> String {
    format!("/devices/{}", device)
}
