//! OS-facing adapters behind small traits.
//!
//! - [`EventSource`]: event-log subscription (Windows `wevtapi`)
//! - [`ServiceController`]: service state queries
//! - [`AclApplier`]: access-control hardening for files and the service
//! - [`FileHasher`]: SHA-256 of protected files
//! - [`InventoryProvider`]: installed software and services
//!
//! Everything above the platform layer talks to the traits only, so tests can
//! swap in fakes.

use crate::inventory::{ServiceEntry, SoftwareEntry};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to subscribe to {channel}: {reason}")]
    Subscribe { channel: String, reason: String },
    #[error("failed to read from {channel}: {reason}")]
    Read { channel: String, reason: String },
    #[error("failed to render event: {0}")]
    Render(String),
    #[error("event log collection is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed: {reason}")]
    Command { command: String, reason: String },
    #[error("not supported on this platform")]
    Unsupported,
}

/// Opens per-channel subscriptions that only deliver events raised after subscribing.
pub trait EventSource: Send + Sync {
    fn subscribe(&self, channel: &str) -> Result<Box<dyn ChannelSubscription>, SourceError>;
}

/// Rendered records come back as event XML. A failed render is reported in
/// place so the caller can skip that record and keep the rest.
pub trait ChannelSubscription: Send {
    fn next_batch(&mut self, max: usize) -> Result<Vec<Result<String, SourceError>>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Stopped,
    Pending,
    NotInstalled,
}

#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn state(&self, service: &str) -> Result<ServiceState, PlatformError>;
}

#[async_trait]
pub trait AclApplier: Send + Sync {
    /// Restrict a file or directory to SYSTEM/root and administrators.
    async fn harden_path(&self, path: &Path) -> Result<(), PlatformError>;
    async fn harden_service(&self, service: &str) -> Result<(), PlatformError>;
}

pub trait FileHasher: Send + Sync {
    /// Hex SHA-256 of the file contents.
    fn hash(&self, path: &Path) -> Result<String, PlatformError>;
}

#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn installed_software(&self) -> Result<Vec<SoftwareEntry>, PlatformError>;
    async fn services(&self) -> Result<Vec<ServiceEntry>, PlatformError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256FileHasher;

impl FileHasher for Sha256FileHasher {
    fn hash(&self, path: &Path) -> Result<String, PlatformError> {
        let io_err = |source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::File::open(path).map_err(io_err)?;
        let mut h = Sha256::new();
        std::io::copy(&mut file, &mut h).map_err(io_err)?;
        Ok(format!("{:x}", h.finalize()))
    }
}

/// Output of a helper command; non-zero exit is not an error by itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn into_stdout(self, command: &str) -> Result<String, PlatformError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(PlatformError::Command {
                command: command.to_string(),
                reason: format!("exit {:?}: {}", self.code, self.stderr.trim()),
            })
        }
    }
}

pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput, PlatformError> {
    let out = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| PlatformError::Command {
            command: program.to_string(),
            reason: e.to_string(),
        })?;
    Ok(CommandOutput {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Parse the `STATE` line of `sc query <name>` output.
pub fn parse_sc_state(output: &str) -> ServiceState {
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with("STATE") {
            continue;
        }
        let upper = line.to_ascii_uppercase();
        return if upper.contains("RUNNING") {
            ServiceState::Running
        } else if upper.contains("PENDING") {
            ServiceState::Pending
        } else {
            ServiceState::Stopped
        };
    }
    ServiceState::NotInstalled
}

/// Map `systemctl is-active` output to a state.
pub fn parse_systemctl_state(output: &str) -> ServiceState {
    match output.trim() {
        "active" | "reloading" => ServiceState::Running,
        "activating" | "deactivating" => ServiceState::Pending,
        "inactive" | "failed" => ServiceState::Stopped,
        _ => ServiceState::NotInstalled,
    }
}

/// Sources that do nothing but say so; used where no event log exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedEventSource;

impl EventSource for UnsupportedEventSource {
    fn subscribe(&self, _channel: &str) -> Result<Box<dyn ChannelSubscription>, SourceError> {
        Err(SourceError::Unsupported)
    }
}

pub fn default_event_source() -> Arc<dyn EventSource> {
    #[cfg(windows)]
    {
        Arc::new(windows::WevtEventSource)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnsupportedEventSource)
    }
}

pub fn default_service_controller() -> Arc<dyn ServiceController> {
    #[cfg(windows)]
    {
        Arc::new(windows::ScServiceController)
    }
    #[cfg(unix)]
    {
        Arc::new(unix::SystemdServiceController)
    }
}

pub fn default_acl_applier() -> Arc<dyn AclApplier> {
    #[cfg(windows)]
    {
        Arc::new(windows::IcaclsApplier)
    }
    #[cfg(unix)]
    {
        Arc::new(unix::ModeApplier)
    }
}

pub fn default_file_hasher() -> Arc<dyn FileHasher> {
    Arc::new(Sha256FileHasher)
}

pub fn default_inventory_provider() -> Arc<dyn InventoryProvider> {
    #[cfg(windows)]
    {
        Arc::new(windows::RegistryInventory)
    }
    #[cfg(unix)]
    {
        Arc::new(unix::PackageInventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f.txt");
        std::fs::write(&p, b"abc").unwrap();
        assert_eq!(
            Sha256FileHasher.hash(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hashing_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Sha256FileHasher.hash(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(err, PlatformError::Io { .. }));
    }

    #[test]
    fn sc_query_states() {
        let running = "SERVICE_NAME: SIEMAgent\n        TYPE               : 10  WIN32_OWN_PROCESS\n        STATE              : 4  RUNNING\n";
        assert_eq!(parse_sc_state(running), ServiceState::Running);
        let stopped = "        STATE              : 1  STOPPED\n";
        assert_eq!(parse_sc_state(stopped), ServiceState::Stopped);
        let pending = "        STATE              : 2  START_PENDING\n";
        assert_eq!(parse_sc_state(pending), ServiceState::Pending);
        assert_eq!(
            parse_sc_state("[SC] EnumQueryServicesStatus:OpenService FAILED 1060"),
            ServiceState::NotInstalled
        );
    }

    #[test]
    fn systemctl_states() {
        assert_eq!(parse_systemctl_state("active\n"), ServiceState::Running);
        assert_eq!(parse_systemctl_state("failed"), ServiceState::Stopped);
        assert_eq!(parse_systemctl_state("activating"), ServiceState::Pending);
        assert_eq!(parse_systemctl_state("unknown"), ServiceState::NotInstalled);
    }

    #[test]
    fn unsupported_source_refuses() {
        assert!(matches!(
            UnsupportedEventSource.subscribe("Security"),
            Err(SourceError::Unsupported)
        ));
    }
}
