//! Self-protection supervisor: file integrity, service state and one-time ACL hardening.
//!
//! Each protected file moves through `Unknown → Hashed → {Unchanged, Modified, Deleted}`.
//! A modification updates the stored digest so the same change alerts once; a
//! deleted file keeps its last digest and alerts again only after it reappears
//! and goes away a second time.

pub mod alerts;

use crate::config::ProtectionConfig;
use crate::platform::{AclApplier, FileHasher, PlatformError, ServiceController, ServiceState};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use alerts::{AlertKind, AlertSink, QueueAlertSink, TamperAlert};

const MAX_DEPTH: usize = 4;
const MAX_FILES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Unknown,
    Hashed,
    Unchanged,
    Modified,
    Deleted,
}

/// Restores a tampered file. Restoration from backup is not implemented;
/// the default hook only records that it was asked.
pub trait SelfHeal: Send + Sync {
    fn restore(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSelfHeal;

impl SelfHeal for NoopSelfHeal {
    fn restore(&self, path: &Path) -> bool {
        debug!(path = %path.display(), "self-heal requested; no backup configured");
        false
    }
}

#[derive(Debug, Clone)]
struct ProtectedFile {
    path: PathBuf,
    digest: Option<String>,
    state: FileState,
}

/// Files under `roots`; directories are walked (bounded depth and count).
pub fn expand_paths(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for root in roots {
        if root.is_dir() {
            out.extend(
                WalkDir::new(root)
                    .max_depth(MAX_DEPTH)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_file())
                    .map(|e| e.into_path())
                    .take(MAX_FILES),
            );
        } else {
            out.push(root.clone());
        }
    }
    out.sort();
    out.dedup();
    out
}

pub struct Supervisor {
    config: ProtectionConfig,
    roots: Vec<PathBuf>,
    files: Vec<ProtectedFile>,
    hasher: Arc<dyn FileHasher>,
    services: Arc<dyn ServiceController>,
    acl: Arc<dyn AclApplier>,
    sink: Arc<dyn AlertSink>,
    heal: Arc<dyn SelfHeal>,
    service_alerted: bool,
}

impl Supervisor {
    pub fn new(
        config: ProtectionConfig,
        roots: Vec<PathBuf>,
        hasher: Arc<dyn FileHasher>,
        services: Arc<dyn ServiceController>,
        acl: Arc<dyn AclApplier>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            roots,
            files: Vec::new(),
            hasher,
            services,
            acl,
            sink,
            heal: Arc::new(NoopSelfHeal),
            service_alerted: false,
        }
    }

    pub fn with_self_heal(mut self, heal: Arc<dyn SelfHeal>) -> Self {
        self.heal = heal;
        self
    }

    pub fn file_state(&self, path: &Path) -> Option<FileState> {
        self.files.iter().find(|f| f.path == path).map(|f| f.state)
    }

    pub fn digest(&self, path: &Path) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.digest.as_deref())
    }

    /// Hash `paths` on the blocking pool. `None` if the hashing task died.
    async fn hash_files(&self, paths: Vec<PathBuf>) -> Option<Vec<Result<String, PlatformError>>> {
        let hasher = self.hasher.clone();
        let hashed = tokio::task::spawn_blocking(move || {
            paths.iter().map(|p| hasher.hash(p)).collect::<Vec<_>>()
        })
        .await;
        match hashed {
            Ok(digests) => Some(digests),
            Err(e) => {
                warn!(error = %e, "hashing task failed");
                None
            }
        }
    }

    /// Hash every protected file and remember the digests.
    pub async fn initialize(&mut self) {
        let roots = self.roots.clone();
        let paths = tokio::task::spawn_blocking(move || expand_paths(&roots))
            .await
            .unwrap_or_default();
        let digests = self.hash_files(paths.clone()).await.unwrap_or_default();
        let mut digests = digests.into_iter();
        self.files = paths
            .into_iter()
            .map(|path| match digests.next() {
                Some(Ok(d)) => ProtectedFile {
                    path,
                    digest: Some(d),
                    state: FileState::Hashed,
                },
                Some(Err(e)) => {
                    warn!(path = %path.display(), error = %e, "cannot hash protected file");
                    ProtectedFile {
                        path,
                        digest: None,
                        state: FileState::Unknown,
                    }
                }
                None => ProtectedFile {
                    path,
                    digest: None,
                    state: FileState::Unknown,
                },
            })
            .collect();
        info!(files = self.files.len(), "integrity baseline recorded");
    }

    /// Restrict protected files, their directories and the service. Runs once.
    pub async fn harden(&self) {
        let mut targets: Vec<PathBuf> = self.roots.clone();
        targets.extend(self.files.iter().map(|f| f.path.clone()));
        targets.sort();
        targets.dedup();
        for path in &targets {
            if let Err(e) = self.acl.harden_path(path).await {
                warn!(path = %path.display(), error = %e, "ACL hardening failed");
            }
        }
        if let Err(e) = self.acl.harden_service(&self.config.service_name).await {
            warn!(service = %self.config.service_name, error = %e, "service ACL hardening failed");
        }
        info!(paths = targets.len(), "ACL hardening applied");
    }

    /// Re-hash every file, raising alerts for changes and disappearances.
    pub async fn check_integrity(&mut self) -> Vec<TamperAlert> {
        let paths = self.files.iter().map(|f| f.path.clone()).collect();
        let Some(digests) = self.hash_files(paths).await else {
            return Vec::new();
        };
        let mut raised = Vec::new();
        for (file, digest) in self.files.iter_mut().zip(digests) {
            match digest {
                Ok(current) => match file.digest.as_deref() {
                    None => {
                        file.digest = Some(current);
                        file.state = FileState::Hashed;
                    }
                    Some(prev) if prev == current => file.state = FileState::Unchanged,
                    Some(prev) => {
                        let alert = TamperAlert {
                            kind: AlertKind::FileModified,
                            path: Some(file.path.clone()),
                            service: None,
                            previous_hash: Some(prev.to_string()),
                            current_hash: Some(current.clone()),
                            detail: format!("Protected file modified: {}", file.path.display()),
                            detected_at: Utc::now(),
                        };
                        file.digest = Some(current);
                        file.state = FileState::Modified;
                        self.sink.raise(alert.clone());
                        self.heal.restore(&file.path);
                        raised.push(alert);
                    }
                },
                Err(e) => {
                    if file.state == FileState::Deleted || file.digest.is_none() {
                        continue;
                    }
                    debug!(path = %file.path.display(), error = %e, "protected file unreadable");
                    let alert = TamperAlert {
                        kind: AlertKind::FileDeleted,
                        path: Some(file.path.clone()),
                        service: None,
                        previous_hash: file.digest.clone(),
                        current_hash: None,
                        detail: format!("Protected file deleted or unreadable: {}", file.path.display()),
                        detected_at: Utc::now(),
                    };
                    file.state = FileState::Deleted;
                    self.sink.raise(alert.clone());
                    raised.push(alert);
                }
            }
        }
        raised
    }

    /// Alert once per transition away from running.
    pub async fn check_service(&mut self) -> Option<TamperAlert> {
        let name = self.config.service_name.clone();
        match self.services.state(&name).await {
            Ok(ServiceState::Running) => {
                self.service_alerted = false;
                None
            }
            Ok(ServiceState::Stopped) if !self.service_alerted => {
                self.service_alerted = true;
                let alert = TamperAlert {
                    kind: AlertKind::ServiceStopped,
                    path: None,
                    service: Some(name.clone()),
                    previous_hash: None,
                    current_hash: None,
                    detail: format!("Agent service {} is not running", name),
                    detected_at: Utc::now(),
                };
                self.sink.raise(alert.clone());
                Some(alert)
            }
            Ok(ServiceState::NotInstalled) => {
                debug!(service = %name, "agent service not installed; running standalone");
                None
            }
            Ok(_) => None,
            Err(e) => {
                warn!(service = %name, error = %e, "service state query failed");
                None
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        if self.config.integrity_check {
            self.initialize().await;
        }
        if self.config.harden_acl {
            self.harden().await;
        }

        let period = Duration::from_secs(self.config.check_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.config.integrity_check {
                        self.check_integrity().await;
                    }
                    if self.config.monitor_service {
                        self.check_service().await;
                    }
                }
            }
        }
        debug!("supervisor stopped");
    }
}
