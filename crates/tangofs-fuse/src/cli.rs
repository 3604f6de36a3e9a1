use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tangofs_db::{MemoryDatabase, Snapshot};
use tracing::info;

use crate::config::TangoFsConfig;
use crate::filesystem::TangoFsFilesystem;
use crate::namespace::Namespace;
use crate::node::{COMMANDS, DEVICES};
use crate::ops::TangoFs;

#[derive(Parser)]
#[command(name = "tangofs")]
#[command(about = "Browse and edit a Tango control system as a filesystem", long_about = None)]
pub struct Cli {
    /// Control-system snapshot (JSON) backing the namespace.
    #[arg(short, long, env = "TANGOFS_SNAPSHOT")]
    pub snapshot: PathBuf,

    /// TOML or JSON configuration file.
    #[arg(short, long, env = "TANGOFS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Mount the namespace until interrupted.
    Mount {
        mountpoint: PathBuf,
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        read_only: bool,
        /// Write the snapshot back on unmount.
        #[arg(long)]
        save: bool,
    },
    /// Print a subtree as JSON.
    Tree {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long, default_value = "2")]
        depth: usize,
    },
    /// Run a device command, as the generated command scripts do.
    Run {
        device: String,
        command: String,
        argument: Option<String>,
    },
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    Snapshot::from_json(&text).with_context(|| format!("parsing snapshot {}", path.display()))
}

impl Cli {
    fn load_config(&self) -> Result<TangoFsConfig> {
        match &self.config {
            Some(path) => TangoFsConfig::from_file(path),
            None => Ok(TangoFsConfig::default()),
        }
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let db = Arc::new(
            MemoryDatabase::from_snapshot(load_snapshot(&self.snapshot)?)
                .with_timeout_ms(config.request_timeout_ms),
        );
        match self.command {
            Command::Mount {
                ref mountpoint,
                allow_other,
                read_only,
                save,
            } => {
                mount(db.clone(), config, mountpoint, allow_other, read_only).await?;
                if save {
                    let json = serde_json::to_string_pretty(&db.snapshot())?;
                    std::fs::write(&self.snapshot, json)?;
                    info!("saved snapshot to {}", self.snapshot.display());
                }
                Ok(())
            }
            Command::Tree { ref path, depth } => {
                let ns = Namespace::new(db, &config);
                let tree = ns.to_json(path, depth)?;
                println!("{}", serde_json::to_string_pretty(&tree)?);
                Ok(())
            }
            Command::Run {
                ref device,
                ref command,
                ref argument,
            } => {
                let ns = Namespace::new(db, &config);
                let output = run_command(&ns, device, command, argument.as_deref())?;
                print!("{}", output);
                Ok(())
            }
        }
    }
}

async fn mount(
    db: Arc<MemoryDatabase>,
    mut config: TangoFsConfig,
    mountpoint: &Path,
    allow_other: bool,
    read_only: bool,
) -> Result<()> {
    if config.uid == 0 && config.gid == 0 {
        // SAFETY: getuid/getgid cannot fail
        config.uid = unsafe { libc::getuid() };
        config.gid = unsafe { libc::getgid() };
    }
    let (uid, gid) = (config.uid, config.gid);
    let fs = TangoFs::new(db, config)?;

    let mut options = vec![fuser::MountOption::FSName("tangofs".to_string())];
    if allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if read_only {
        options.push(fuser::MountOption::RO);
    }

    info!("mounting on {}", mountpoint.display());
    let session = fuser::spawn_mount2(TangoFsFilesystem::new(fs, uid, gid), mountpoint, &options)
        .with_context(|| format!("mounting {}", mountpoint.display()))?;
    tokio::signal::ctrl_c().await?;
    info!("unmounting {}", mountpoint.display());
    drop(session);
    Ok(())
}

/// Invokes `command` on `device` and returns the output as text.
pub fn run_command(
    ns: &Namespace,
    device: &str,
    command: &str,
    argument: Option<&str>,
) -> Result<String> {
    let parts: Vec<&str> = device.split('/').collect();
    if parts.len() != 3 {
        anyhow::bail!("'{}' is not a domain/family/member device name", device);
    }
    let node = ns.resolve(&[DEVICES, parts[0], parts[1], parts[2], COMMANDS, command])?;
    let Some(cmd) = node.as_command() else {
        anyhow::bail!("{} is not a command of {}", command, device);
    };
    let mut output = cmd.invoke_text(argument)?;
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tangofs_db::{AttrValue, CommandInfo, DataType, DeviceSpec, Scalar};

    fn namespace() -> Namespace {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_device(&DeviceSpec::new("sys/tg_test/1", "TangoTest", "TangoTest/test"));
        db.insert_command(
            "sys/tg_test/1",
            CommandInfo::new("State", DataType::Void, DataType::String),
            Some(AttrValue::Scalar(Scalar::Str("ON".to_string()))),
        );
        Namespace::with_options(db, None, Duration::ZERO, '%')
    }

    #[test]
    fn test_cli_parses_mount() {
        let cli = Cli::try_parse_from([
            "tangofs",
            "--snapshot",
            "db.json",
            "mount",
            "/mnt/tango",
            "--save",
        ])
        .unwrap();
        match cli.command {
            Command::Mount {
                mountpoint, save, ..
            } => {
                assert_eq!(mountpoint, PathBuf::from("/mnt/tango"));
                assert!(save);
            }
            _ => panic!("expected mount"),
        }
    }

    #[test]
    fn test_cli_parses_run_with_argument() {
        let cli =
            Cli::try_parse_from(["tangofs", "-s", "db.json", "run", "a/b/c", "DevLong", "5"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Command::Run { argument: Some(ref a), .. } if a == "5"
        ));
    }

    #[test]
    fn test_run_command() {
        let ns = namespace();
        let out = run_command(&ns, "sys/tg_test/1", "State", None).unwrap();
        assert_eq!(out, "ON\n");
        assert!(run_command(&ns, "sys/tg_test", "State", None).is_err());
        assert!(run_command(&ns, "sys/tg_test/1", "Missing", None).is_err());
    }

    #[test]
    fn test_load_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"devices": {"Sys/TG_Test/1": {"class_name": "TangoTest", "server": "TangoTest/test"}}}"#,
        )
        .unwrap();
        let snapshot = load_snapshot(&path).unwrap();
        assert!(snapshot.devices.contains_key("sys/tg_test/1"));
        assert!(snapshot.servers.contains("TangoTest/test"));
        assert!(load_snapshot(&dir.path().join("missing.json")).is_err());
    }
}
