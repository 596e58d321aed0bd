//! Periodic asset snapshot: installed software and services.

use crate::client::ServerApi;
use crate::config::InventoryConfig;
use crate::platform::{InventoryProvider, PlatformError};
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftwareEntry {
    pub name: String,
    pub version: String,
    pub publisher: String,
    /// As reported by the package database, usually `YYYYMMDD`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    pub display_name: String,
    /// Lower-case state word, e.g. `running`, `stopped`
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReport {
    pub agent_id: String,
    pub collected_at: DateTime<Utc>,
    pub software: Vec<SoftwareEntry>,
    pub services: Vec<ServiceEntry>,
}

/// Parse `reg query <Uninstall key> /s` output. Keys without a `DisplayName`
/// and system components are skipped.
pub fn parse_reg_uninstall(output: &str) -> Vec<SoftwareEntry> {
    let mut out = Vec::new();
    let mut current: Option<(SoftwareEntry, bool)> = None;

    let mut finish = |entry: Option<(SoftwareEntry, bool)>| {
        if let Some((e, system)) = entry {
            if !e.name.is_empty() && !system {
                out.push(e);
            }
        }
    };

    for line in output.lines() {
        if line.starts_with("HKEY_") {
            finish(current.take());
            current = Some((SoftwareEntry::default(), false));
            continue;
        }
        let Some((entry, system)) = current.as_mut() else {
            continue;
        };
        let Some(pos) = line.find(" REG_") else {
            continue;
        };
        let name = line[..pos].trim();
        let value = line[pos + 1..]
            .split_once(char::is_whitespace)
            .map(|(_, v)| v.trim())
            .unwrap_or("");
        match name {
            "DisplayName" => entry.name = value.to_string(),
            "DisplayVersion" => entry.version = value.to_string(),
            "Publisher" => entry.publisher = value.to_string(),
            "InstallDate" => entry.install_date = value.to_string(),
            "SystemComponent" => *system = value == "0x1",
            _ => {}
        }
    }
    finish(current.take());
    out
}

/// Parse `sc query type= service state= all` output.
pub fn parse_sc_query_all(output: &str) -> Vec<ServiceEntry> {
    let mut out: Vec<ServiceEntry> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("SERVICE_NAME:") {
            out.push(ServiceEntry {
                name: name.trim().to_string(),
                ..Default::default()
            });
        } else if let Some(display) = line.strip_prefix("DISPLAY_NAME:") {
            if let Some(last) = out.last_mut() {
                last.display_name = display.trim().to_string();
            }
        } else if line.starts_with("STATE") {
            if let Some(last) = out.last_mut() {
                last.state = line
                    .split_whitespace()
                    .last()
                    .unwrap_or("")
                    .to_ascii_lowercase();
            }
        }
    }
    out
}

/// Parse `dpkg-query -W -f '${Package}\t${Version}\t${Maintainer}\n'`.
pub fn parse_dpkg_query(output: &str) -> Vec<SoftwareEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(SoftwareEntry {
                name: name.to_string(),
                version: cols.next().unwrap_or("").trim().to_string(),
                publisher: cols.next().unwrap_or("").trim().to_string(),
                install_date: String::new(),
            })
        })
        .collect()
}

/// Parse `systemctl list-units --type=service --all --no-legend --plain`.
pub fn parse_systemctl_units(output: &str) -> Vec<ServiceEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let unit = cols.next()?;
            let name = unit.strip_suffix(".service")?;
            let _load = cols.next()?;
            let _active = cols.next()?;
            let sub = cols.next()?;
            let description = cols.collect::<Vec<_>>().join(" ");
            Some(ServiceEntry {
                name: name.to_string(),
                display_name: description,
                state: sub.to_ascii_lowercase(),
            })
        })
        .collect()
}

pub struct InventoryScanner {
    config: InventoryConfig,
    api: Arc<dyn ServerApi>,
    provider: Arc<dyn InventoryProvider>,
    state: SharedState,
}

impl InventoryScanner {
    pub fn new(
        config: InventoryConfig,
        api: Arc<dyn ServerApi>,
        provider: Arc<dyn InventoryProvider>,
        state: SharedState,
    ) -> Self {
        Self {
            config,
            api,
            provider,
            state,
        }
    }

    /// Gather both lists. A failed list is logged and reported empty.
    pub async fn collect(&self) -> InventoryReport {
        let software = self
            .provider
            .installed_software()
            .await
            .unwrap_or_else(|e: PlatformError| {
                warn!(error = %e, "software inventory failed");
                Vec::new()
            });
        let services = self.provider.services().await.unwrap_or_else(|e| {
            warn!(error = %e, "service inventory failed");
            Vec::new()
        });
        InventoryReport {
            agent_id: self.state.agent_id(),
            collected_at: Utc::now(),
            software,
            services,
        }
    }

    /// One best-effort scan. Returns true when the server accepted the report.
    pub async fn scan_once(&self) -> bool {
        if !self.state.is_registered() {
            debug!("inventory skipped: agent not registered");
            return false;
        }
        let report = self.collect().await;
        match self.api.send_inventory(&report).await {
            Ok(()) => {
                self.state.record_inventory(report.collected_at);
                info!(
                    software = report.software.len(),
                    services = report.services.len(),
                    "inventory sent"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "inventory upload failed");
                false
            }
        }
    }

    /// Scan now and then every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }
        debug!("inventory scanner stopped");
    }
}
