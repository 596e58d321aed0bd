//! Software-install control: spots installer launches in process-creation
//! events and brokers an approval decision with the server.

use super::EventInspector;
use crate::client::{ClientError, ServerApi};
use crate::config::SoftwareControlConfig;
use crate::event::Event;
use crate::state::SharedState;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Approved,
    Denied,
    AutoApproved,
    Installing,
    Installed,
    Failed,
}

impl InstallStatus {
    /// Pending and installing requests are still waiting on the server.
    pub fn is_terminal(self) -> bool {
        !matches!(self, InstallStatus::Pending | InstallStatus::Installing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallRequest {
    /// Local id
    pub id: String,
    /// Assigned once the server accepted the request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub agent_id: String,
    pub software_name: String,
    pub installer_path: String,
    pub command_line: String,
    pub requester: String,
    pub status: InstallStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where approval decisions come from.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    /// Returns the server-side id.
    async fn submit(&self, req: &InstallRequest) -> Result<String, ClientError>;
    async fn poll(&self, server_id: &str) -> Result<InstallStatus, ClientError>;
}

pub struct HttpApprovalGateway {
    api: Arc<dyn ServerApi>,
}

impl HttpApprovalGateway {
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ApprovalGateway for HttpApprovalGateway {
    async fn submit(&self, req: &InstallRequest) -> Result<String, ClientError> {
        self.api.submit_install_request(req).await
    }

    async fn poll(&self, server_id: &str) -> Result<InstallStatus, ClientError> {
        self.api.install_request_status(server_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedInstaller {
    pub installer_path: String,
    pub software_name: String,
}

fn is_process_creation(ev: &Event) -> bool {
    if ev.source_type == "Sysmon" {
        ev.event_code == 1
    } else {
        ev.event_code == 4688
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(&['\\', '/'][..]).next().unwrap_or(path)
}

fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Split a command line on whitespace, keeping double-quoted runs together.
fn split_args(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    for c in cmd.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Recognize `msiexec` with an `.msi` argument, `setup*.exe` and `*install*.exe`.
/// An `.msi` argument to any other image does not count.
pub fn detect_installer(ev: &Event) -> Option<DetectedInstaller> {
    if !is_process_creation(ev) || ev.process_name.is_empty() {
        return None;
    }
    let image = file_name(&ev.process_name).to_ascii_lowercase();

    if image == "msiexec.exe" {
        let path = split_args(&ev.command_line)
            .into_iter()
            .find(|a| a.to_ascii_lowercase().ends_with(".msi"))?;
        return Some(DetectedInstaller {
            software_name: file_stem(&path).to_string(),
            installer_path: path,
        });
    }

    let looks_like_installer = image.ends_with(".exe")
        && !image.contains("uninst")
        && (image.starts_with("setup") || image.contains("install"));
    looks_like_installer.then(|| DetectedInstaller {
        installer_path: ev.process_name.clone(),
        software_name: file_stem(&ev.process_name).to_string(),
    })
}

pub struct SoftwareControl {
    config: SoftwareControlConfig,
    gateway: Arc<dyn ApprovalGateway>,
    state: SharedState,
    pending: Mutex<HashMap<String, InstallRequest>>,
    wake: Notify,
}

impl SoftwareControl {
    pub fn new(
        config: SoftwareControlConfig,
        gateway: Arc<dyn ApprovalGateway>,
        state: SharedState,
    ) -> Self {
        Self {
            config,
            gateway,
            state,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InstallRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn auto_approved(&self, d: &DetectedInstaller) -> bool {
        let name = d.software_name.to_ascii_lowercase();
        let file = file_name(&d.installer_path).to_ascii_lowercase();
        self.config
            .auto_approve
            .iter()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .any(|p| name.contains(&p) || file.contains(&p))
    }

    /// Record an installer launch. Returns the new request, or `None` when the
    /// event is not an installer or the same installer is already pending.
    pub fn observe(&self, ev: &Event) -> Option<InstallRequest> {
        let detected = detect_installer(ev)?;
        let now = Utc::now();
        let requester = if ev.subject_user.is_empty() {
            ev.target_user.clone()
        } else if ev.subject_domain.is_empty() {
            ev.subject_user.clone()
        } else {
            format!("{}\\{}", ev.subject_domain, ev.subject_user)
        };
        let mut req = InstallRequest {
            id: Uuid::new_v4().to_string(),
            server_id: None,
            agent_id: self.state.agent_id(),
            software_name: detected.software_name.clone(),
            installer_path: detected.installer_path.clone(),
            command_line: ev.command_line.clone(),
            requester,
            status: InstallStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        if self.auto_approved(&detected) {
            req.status = InstallStatus::AutoApproved;
            info!(software = %req.software_name, path = %req.installer_path, "install auto-approved");
        }

        {
            let mut pending = self.lock();
            let dup = pending
                .values()
                .any(|p| p.installer_path.eq_ignore_ascii_case(&req.installer_path));
            if dup {
                debug!(path = %req.installer_path, "installer already pending");
                return None;
            }
            pending.insert(req.id.clone(), req.clone());
        }
        if req.status == InstallStatus::Pending {
            info!(software = %req.software_name, requester = %req.requester, "install request queued");
        }
        self.wake.notify_one();
        Some(req)
    }

    pub fn pending(&self) -> Vec<InstallRequest> {
        self.lock().values().cloned().collect()
    }

    pub async fn poll_once(&self) -> Vec<InstallRequest> {
        self.poll_once_at(Utc::now()).await
    }

    /// Report an auto-approved request to the server. Best effort: kept for
    /// the next round on failure, forgotten once the approval timeout passes.
    async fn report_auto_approved(&self, req: &mut InstallRequest, expired: bool) {
        if expired {
            debug!(id = %req.id, "auto-approval never reached the server");
            self.lock().remove(&req.id);
            return;
        }
        if !self.state.is_registered() {
            return;
        }
        req.agent_id = self.state.agent_id();
        match self.gateway.submit(req).await {
            Ok(server_id) => {
                debug!(id = %req.id, server_id = %server_id, "auto-approval reported");
                self.lock().remove(&req.id);
            }
            Err(e) => warn!(id = %req.id, error = %e, "auto-approval report failed"),
        }
    }

    /// Submit new requests, poll submitted ones, expire stale ones. Returns the
    /// requests that reached a final state in this round.
    pub async fn poll_once_at(&self, now: DateTime<Utc>) -> Vec<InstallRequest> {
        let timeout = ChronoDuration::seconds(self.config.approval_timeout_secs as i64);
        let snapshot = self.pending();
        let mut finished = Vec::new();

        for mut req in snapshot {
            if req.status == InstallStatus::AutoApproved {
                let expired = now - req.created_at > timeout;
                self.report_auto_approved(&mut req, expired).await;
                continue;
            }
            if now - req.created_at > timeout {
                warn!(software = %req.software_name, id = %req.id, "install approval timed out");
                req.status = InstallStatus::Failed;
                req.updated_at = now;
                self.lock().remove(&req.id);
                finished.push(req);
                continue;
            }

            match req.server_id.clone() {
                None => {
                    if !self.state.is_registered() {
                        continue;
                    }
                    req.agent_id = self.state.agent_id();
                    match self.gateway.submit(&req).await {
                        Ok(server_id) => {
                            debug!(id = %req.id, server_id = %server_id, "install request submitted");
                            if let Some(p) = self.lock().get_mut(&req.id) {
                                p.server_id = Some(server_id);
                                p.agent_id = req.agent_id.clone();
                                p.updated_at = now;
                            }
                        }
                        Err(e) => warn!(id = %req.id, error = %e, "install request submit failed"),
                    }
                }
                Some(server_id) => match self.gateway.poll(&server_id).await {
                    Ok(status) if status != req.status => {
                        info!(
                            software = %req.software_name,
                            from = ?req.status,
                            to = ?status,
                            "install request status changed"
                        );
                        req.status = status;
                        req.updated_at = now;
                        let mut pending = self.lock();
                        if status.is_terminal() {
                            pending.remove(&req.id);
                            finished.push(req);
                        } else if let Some(p) = pending.get_mut(&req.id) {
                            p.status = status;
                            p.updated_at = now;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(id = %req.id, error = %e, "install status poll failed"),
                },
            }
        }
        finished
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.poll_once().await;
        }
        debug!("software control stopped");
    }
}

impl EventInspector for SoftwareControl {
    fn inspect(&self, event: &Event) {
        self.observe(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentIdentity;

    #[derive(Default)]
    struct FakeGateway {
        submitted: Mutex<Vec<InstallRequest>>,
        statuses: Mutex<HashMap<String, InstallStatus>>,
    }

    impl FakeGateway {
        fn set(&self, server_id: &str, status: InstallStatus) {
            self.statuses.lock().unwrap().insert(server_id.into(), status);
        }
    }

    #[async_trait]
    impl ApprovalGateway for FakeGateway {
        async fn submit(&self, req: &InstallRequest) -> Result<String, ClientError> {
            let mut s = self.submitted.lock().unwrap();
            s.push(req.clone());
            Ok(format!("srv-{}", s.len()))
        }

        async fn poll(&self, server_id: &str) -> Result<InstallStatus, ClientError> {
            Ok(self
                .statuses
                .lock()
                .unwrap()
                .get(server_id)
                .copied()
                .unwrap_or(InstallStatus::Pending))
        }
    }

    fn proc_event(image: &str, cmd: &str) -> Event {
        Event {
            source_type: "Windows Security".into(),
            event_code: 4688,
            process_name: image.into(),
            command_line: cmd.into(),
            subject_user: "bob".into(),
            subject_domain: "CORP".into(),
            ..Default::default()
        }
    }

    fn control(auto: &[&str]) -> (Arc<FakeGateway>, SoftwareControl) {
        let gw = Arc::new(FakeGateway::default());
        let state = SharedState::new(AgentIdentity::new("ws01"));
        state.set_agent_id("a-1");
        let config = SoftwareControlConfig {
            enabled: true,
            auto_approve: auto.iter().map(|s| s.to_string()).collect(),
            ..SoftwareControlConfig::default()
        };
        (gw.clone(), SoftwareControl::new(config, gw, state))
    }

    #[test]
    fn detects_installers() {
        let msi = proc_event(
            r"C:\Windows\System32\msiexec.exe",
            r#"msiexec.exe /i "C:\Users\bob\Downloads\7z 2301-x64.msi" /qn"#,
        );
        let d = detect_installer(&msi).unwrap();
        assert_eq!(d.installer_path, r"C:\Users\bob\Downloads\7z 2301-x64.msi");
        assert_eq!(d.software_name, "7z 2301-x64");

        let setup = proc_event(r"C:\Temp\SetupTool.exe", "SetupTool.exe");
        assert_eq!(detect_installer(&setup).unwrap().software_name, "SetupTool");

        let inst = proc_event(r"C:\Temp\node-installer.exe", "");
        assert!(detect_installer(&inst).is_some());

        assert!(detect_installer(&proc_event(r"C:\Temp\uninstall.exe", "")).is_none());
        assert!(detect_installer(&proc_event(r"C:\Windows\notepad.exe", "")).is_none());
        assert!(detect_installer(&proc_event(r"C:\Windows\System32\msiexec.exe", "/x {GUID}")).is_none());
        assert!(detect_installer(&proc_event(r"C:\Windows\notepad.exe", r"notepad.exe C:\x.msi")).is_none());

        let mut other = proc_event(r"C:\Temp\setup.exe", "");
        other.event_code = 4689;
        assert!(detect_installer(&other).is_none());

        let mut sysmon = proc_event(r"C:\Temp\setup.exe", "");
        sysmon.source_type = "Sysmon".into();
        sysmon.event_code = 1;
        assert!(detect_installer(&sysmon).is_some());
    }

    #[test]
    fn duplicate_installer_is_ignored() {
        let (_, sc) = control(&[]);
        let ev = proc_event(r"C:\Temp\setup.exe", "");
        let req = sc.observe(&ev).unwrap();
        assert_eq!(req.status, InstallStatus::Pending);
        assert_eq!(req.requester, r"CORP\bob");
        assert!(sc.observe(&ev).is_none());
        assert_eq!(sc.pending().len(), 1);
    }

    #[tokio::test]
    async fn auto_approved_is_reported_not_polled() {
        let (gw, sc) = control(&["7-zip", "setup"]);
        let req = sc.observe(&proc_event(r"C:\Temp\setup.exe", "")).unwrap();
        assert_eq!(req.status, InstallStatus::AutoApproved);

        assert!(sc.poll_once().await.is_empty());
        let submitted = gw.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].status, InstallStatus::AutoApproved);
        assert_eq!(submitted[0].agent_id, "a-1");
        assert!(sc.pending().is_empty());

        sc.poll_once().await;
        assert_eq!(gw.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreported_auto_approval_is_forgotten_after_timeout() {
        let (gw, sc) = control(&["setup"]);
        let req = sc.observe(&proc_event(r"C:\Temp\setup.exe", "")).unwrap();
        let later = req.created_at + ChronoDuration::seconds(31 * 60);

        assert!(sc.poll_once_at(later).await.is_empty());
        assert!(gw.submitted.lock().unwrap().is_empty());
        assert!(sc.pending().is_empty());
    }

    #[tokio::test]
    async fn submit_then_resolve() {
        let (gw, sc) = control(&[]);
        sc.observe(&proc_event(r"C:\Temp\setup.exe", "")).unwrap();

        assert!(sc.poll_once().await.is_empty());
        let submitted = gw.submitted.lock().unwrap().clone();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].agent_id, "a-1");
        assert_eq!(sc.pending()[0].server_id.as_deref(), Some("srv-1"));

        gw.set("srv-1", InstallStatus::Installing);
        assert!(sc.poll_once().await.is_empty());
        assert_eq!(sc.pending()[0].status, InstallStatus::Installing);

        gw.set("srv-1", InstallStatus::Denied);
        let done = sc.poll_once().await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, InstallStatus::Denied);
        assert!(sc.pending().is_empty());
    }

    #[tokio::test]
    async fn stale_requests_expire() {
        let (_, sc) = control(&[]);
        let req = sc.observe(&proc_event(r"C:\Temp\setup.exe", "")).unwrap();
        let later = req.created_at + ChronoDuration::seconds(31 * 60);
        let done = sc.poll_once_at(later).await;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status, InstallStatus::Failed);
        assert!(sc.pending().is_empty());
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(serde_json::to_string(&InstallStatus::AutoApproved).unwrap(), "\"auto_approved\"");
        let s: InstallStatus = serde_json::from_str("\"installed\"").unwrap();
        assert!(s.is_terminal());
        assert!(!InstallStatus::Pending.is_terminal());
    }
}
