//! Unix adapters: systemd for service state, file modes for hardening,
//! dpkg/systemctl for inventory.

use super::{
    parse_systemctl_state, run_command, AclApplier, InventoryProvider, PlatformError,
    ServiceController, ServiceState,
};
use crate::inventory::{parse_dpkg_query, parse_systemctl_units, ServiceEntry, SoftwareEntry};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::debug;

pub struct SystemdServiceController;

#[async_trait]
impl ServiceController for SystemdServiceController {
    async fn state(&self, service: &str) -> Result<ServiceState, PlatformError> {
        // is-active exits non-zero for anything but "active"; the text is what counts
        let out = run_command("systemctl", &["is-active", service]).await?;
        Ok(parse_systemctl_state(&out.stdout))
    }
}

/// Strips group/other permission bits; when running as root also hands
/// ownership to root.
pub struct ModeApplier;

#[async_trait]
impl AclApplier for ModeApplier {
    async fn harden_path(&self, path: &Path) -> Result<(), PlatformError> {
        let io_err = |source| PlatformError::Io {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(io_err)?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() & 0o700);
        std::fs::set_permissions(path, perms).map_err(io_err)?;

        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } == 0 {
            std::os::unix::fs::chown(path, Some(0), Some(0)).map_err(io_err)?;
        }
        Ok(())
    }

    async fn harden_service(&self, service: &str) -> Result<(), PlatformError> {
        debug!(service, "unit files are managed by the package; nothing to harden");
        Ok(())
    }
}

pub struct PackageInventory;

#[async_trait]
impl InventoryProvider for PackageInventory {
    async fn installed_software(&self) -> Result<Vec<SoftwareEntry>, PlatformError> {
        let out = run_command(
            "dpkg-query",
            &["-W", "-f", "${Package}\t${Version}\t${Maintainer}\n"],
        )
        .await?
        .into_stdout("dpkg-query")?;
        Ok(parse_dpkg_query(&out))
    }

    async fn services(&self) -> Result<Vec<ServiceEntry>, PlatformError> {
        let out = run_command(
            "systemctl",
            &["list-units", "--type=service", "--all", "--no-legend", "--plain", "--no-pager"],
        )
        .await?
        .into_stdout("systemctl")?;
        Ok(parse_systemctl_units(&out))
    }
}
