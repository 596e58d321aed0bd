//! Startup registration and the periodic heartbeat.

use crate::client::ServerApi;
use crate::config::HeartbeatConfig;
use crate::state::{SharedState, Stats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local facts sent with the registration request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub fqdn: String,
    pub ip_address: String,
    pub os_name: String,
    pub os_version: String,
    pub os_build: String,
    pub domain: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub total_memory_mb: u64,
    pub total_disk_gb: u64,
}

impl SystemInfo {
    pub fn gather() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let hostname = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let domain = local_domain(&hostname);
        let fqdn = qualify(&hostname, &domain);
        let cpu_model = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .unwrap_or_default();
        let total_disk: u64 = Disks::new_with_refreshed_list()
            .iter()
            .map(|d| d.total_space())
            .sum();

        Self {
            hostname,
            fqdn,
            ip_address: primary_ip().map(|ip| ip.to_string()).unwrap_or_default(),
            os_name: System::name().unwrap_or_default(),
            os_version: System::os_version().unwrap_or_default(),
            os_build: System::kernel_version().unwrap_or_default(),
            domain,
            cpu_model,
            cpu_cores: sys.physical_core_count().unwrap_or_else(|| sys.cpus().len()),
            total_memory_mb: sys.total_memory() / (1024 * 1024),
            total_disk_gb: total_disk / (1024 * 1024 * 1024),
        }
    }
}

/// Address of the interface used for outbound traffic. No packet is sent.
pub fn primary_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

fn local_domain(hostname: &str) -> String {
    if let Ok(d) = std::env::var("USERDNSDOMAIN") {
        if !d.trim().is_empty() {
            return d.trim().to_ascii_lowercase();
        }
    }
    hostname
        .split_once('.')
        .map(|(_, d)| d.to_string())
        .unwrap_or_default()
}

fn qualify(hostname: &str, domain: &str) -> String {
    if domain.is_empty() || hostname.contains('.') {
        hostname.to_string()
    } else {
        format!("{}.{}", hostname, domain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    #[serde(flatten)]
    pub system: SystemInfo,
    pub agent_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub version: String,
    pub ip_address: String,
    pub uptime_secs: i64,
    pub timestamp: DateTime<Utc>,
    pub stats: Stats,
}

/// One-shot registration. Failure leaves the agent unregistered and is not fatal.
pub async fn register(api: &dyn ServerApi, state: &SharedState, system: SystemInfo) -> bool {
    let req = RegistrationRequest {
        system,
        agent_version: state.identity().version,
    };
    match api.register(&req).await {
        Ok(resp) if !resp.agent_id.trim().is_empty() => {
            let agent_id = resp.agent_id.trim().to_string();
            if state.set_agent_id(agent_id.clone()) {
                info!(agent_id = %agent_id, hostname = %req.system.hostname, "agent registered");
                true
            } else {
                warn!(agent_id = %agent_id, current = %state.agent_id(), "server returned a different agent id; keeping current");
                false
            }
        }
        Ok(_) => {
            warn!("registration response carried no agent id; continuing unregistered");
            false
        }
        Err(e) => {
            warn!(error = %e, "registration failed; continuing unregistered");
            false
        }
    }
}

pub struct Heartbeat {
    config: HeartbeatConfig,
    api: Arc<dyn ServerApi>,
    state: SharedState,
    ip_address: String,
}

impl Heartbeat {
    pub fn new(
        config: HeartbeatConfig,
        api: Arc<dyn ServerApi>,
        state: SharedState,
        ip_address: String,
    ) -> Self {
        Self {
            config,
            api,
            state,
            ip_address,
        }
    }

    /// One tick: a no-op before registration, otherwise report liveness and counters.
    pub async fn beat(&self) -> bool {
        if !self.state.is_registered() {
            debug!("heartbeat skipped: agent not registered");
            return false;
        }
        let identity = self.state.identity();
        let now = Utc::now();
        let req = HeartbeatRequest {
            agent_id: identity.agent_id.clone(),
            version: identity.version.clone(),
            ip_address: self.ip_address.clone(),
            uptime_secs: identity.uptime_secs(),
            timestamp: now,
            stats: self.state.snapshot(),
        };
        match self.api.heartbeat(&req).await {
            Ok(()) => {
                self.state.record_heartbeat(now);
                debug!(agent_id = %req.agent_id, "heartbeat sent");
                true
            }
            Err(e) => {
                self.state.record_heartbeat_failed();
                warn!(error = %e, "heartbeat failed");
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        debug!("heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AgentIdentity;
    use crate::testing::FakeServer;

    #[test]
    fn fqdn_from_domain() {
        assert_eq!(qualify("ws01", "corp.local"), "ws01.corp.local");
        assert_eq!(qualify("ws01.corp.local", "corp.local"), "ws01.corp.local");
        assert_eq!(qualify("ws01", ""), "ws01");
    }

    #[test]
    fn gather_fills_basics() {
        let info = SystemInfo::gather();
        assert!(!info.hostname.is_empty());
        assert!(info.cpu_cores > 0);
    }

    #[tokio::test]
    async fn register_stores_agent_id() {
        let api = FakeServer::registering("a-100");
        let state = SharedState::new(AgentIdentity::new("ws01"));
        assert!(register(api.as_ref(), &state, SystemInfo::default()).await);
        assert_eq!(state.agent_id(), "a-100");
        assert_eq!(api.registrations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_failure_is_not_fatal() {
        let api = FakeServer::arc();
        let state = SharedState::new(AgentIdentity::new("ws01"));
        assert!(!register(api.as_ref(), &state, SystemInfo::default()).await);
        assert!(!state.is_registered());
    }

    #[tokio::test]
    async fn heartbeat_waits_for_registration() {
        let api = FakeServer::arc();
        let state = SharedState::new(AgentIdentity::new("ws01"));
        let hb = Heartbeat::new(HeartbeatConfig::default(), api.clone(), state.clone(), "10.0.0.9".into());

        assert!(!hb.beat().await);
        assert!(api.heartbeats.lock().unwrap().is_empty());

        state.set_agent_id("a-1");
        state.record_collected(4);
        assert!(hb.beat().await);
        let sent = api.heartbeats.lock().unwrap().clone();
        assert_eq!(sent[0].agent_id, "a-1");
        assert_eq!(sent[0].stats.events_collected, 4);
        assert_eq!(sent[0].ip_address, "10.0.0.9");
        assert!(state.snapshot().last_heartbeat.is_some());

        assert_eq!(state.snapshot().heartbeats_failed, 0);

        *api.fail_heartbeat.lock().unwrap() = true;
        assert!(!hb.beat().await);
        assert!(!hb.beat().await);
        assert_eq!(state.snapshot().heartbeats_failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_ticks_on_interval() {
        let api = FakeServer::arc();
        let state = SharedState::new(AgentIdentity::new("ws01"));
        state.set_agent_id("a-1");
        let hb = Heartbeat::new(HeartbeatConfig { interval_secs: 30 }, api.clone(), state, String::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hb.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(api.heartbeats.lock().unwrap().len(), 3);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn registration_body_is_flat() {
        let req = RegistrationRequest {
            system: SystemInfo {
                hostname: "ws01".into(),
                ..Default::default()
            },
            agent_version: "1.0.0".into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["hostname"], "ws01");
        assert_eq!(v["agent_version"], "1.0.0");
    }
}
