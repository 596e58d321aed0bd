//! In-memory server used by unit tests.

use crate::client::{ClientError, ServerApi};
use crate::collectors::software::{InstallRequest, InstallStatus};
use crate::event::EventBatch;
use crate::inventory::{InventoryReport, ServiceEntry, SoftwareEntry};
use crate::platform::{
    AclApplier, ChannelSubscription, EventSource, InventoryProvider, PlatformError, ServiceController,
    ServiceState, SourceError,
};
use crate::registration::{HeartbeatRequest, RegistrationRequest, RegistrationResponse};
use crate::scripts::{PendingScript, ScriptResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct FakeServer {
    /// `None` makes registration fail
    pub agent_id: Mutex<Option<String>>,
    pub fail_heartbeat: Mutex<bool>,
    /// Answer every event batch with 503
    pub fail_events: Mutex<bool>,
    pub registrations: Mutex<Vec<RegistrationRequest>>,
    pub heartbeats: Mutex<Vec<HeartbeatRequest>>,
    pub batches: Mutex<Vec<EventBatch>>,
    pub inventories: Mutex<Vec<InventoryReport>>,
    pub install_requests: Mutex<Vec<InstallRequest>>,
    pub scripts: Mutex<Vec<PendingScript>>,
    pub script_results: Mutex<Vec<ScriptResult>>,
}

impl FakeServer {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn registering(agent_id: &str) -> Arc<Self> {
        let s = Self::default();
        *s.agent_id.lock().unwrap() = Some(agent_id.to_string());
        Arc::new(s)
    }
}

#[async_trait]
impl ServerApi for FakeServer {
    async fn register(&self, req: &RegistrationRequest) -> Result<RegistrationResponse, ClientError> {
        self.registrations.lock().unwrap().push(req.clone());
        match self.agent_id.lock().unwrap().clone() {
            Some(agent_id) => Ok(RegistrationResponse { agent_id }),
            None => Err(ClientError::Transport("connection refused".into())),
        }
    }

    async fn heartbeat(&self, hb: &HeartbeatRequest) -> Result<(), ClientError> {
        if *self.fail_heartbeat.lock().unwrap() {
            return Err(ClientError::Timeout);
        }
        self.heartbeats.lock().unwrap().push(hb.clone());
        Ok(())
    }

    async fn send_events(&self, batch: &EventBatch) -> Result<(), ClientError> {
        if *self.fail_events.lock().unwrap() {
            return Err(ClientError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn send_inventory(&self, report: &InventoryReport) -> Result<(), ClientError> {
        self.inventories.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn submit_install_request(&self, req: &InstallRequest) -> Result<String, ClientError> {
        let mut reqs = self.install_requests.lock().unwrap();
        reqs.push(req.clone());
        Ok(format!("srv-{}", reqs.len()))
    }

    async fn install_request_status(&self, _server_id: &str) -> Result<InstallStatus, ClientError> {
        Ok(InstallStatus::Pending)
    }

    async fn pending_scripts(&self, _agent_id: &str) -> Result<Vec<PendingScript>, ClientError> {
        Ok(std::mem::take(&mut *self.scripts.lock().unwrap()))
    }

    async fn report_script_result(
        &self,
        _agent_id: &str,
        result: &ScriptResult,
    ) -> Result<(), ClientError> {
        self.script_results.lock().unwrap().push(result.clone());
        Ok(())
    }
}

type Feeds = Arc<Mutex<HashMap<String, VecDeque<Result<String, SourceError>>>>>;

/// Hands out queued records per channel. The channel named `Broken` fails to subscribe.
#[derive(Default, Clone)]
pub(crate) struct FakeSource {
    feeds: Feeds,
}

impl FakeSource {
    pub fn push(&self, channel: &str, r: Result<String, SourceError>) {
        self.feeds
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push_back(r);
    }
}

struct FakeSub {
    channel: String,
    feeds: Feeds,
}

impl ChannelSubscription for FakeSub {
    fn next_batch(&mut self, max: usize) -> Result<Vec<Result<String, SourceError>>, SourceError> {
        let mut feeds = self.feeds.lock().unwrap();
        let q = feeds.entry(self.channel.clone()).or_default();
        let n = q.len().min(max);
        Ok(q.drain(..n).collect())
    }
}

impl EventSource for FakeSource {
    fn subscribe(&self, channel: &str) -> Result<Box<dyn ChannelSubscription>, SourceError> {
        if channel == "Broken" {
            return Err(SourceError::Subscribe {
                channel: channel.into(),
                reason: "access denied".into(),
            });
        }
        Ok(Box::new(FakeSub {
            channel: channel.into(),
            feeds: self.feeds.clone(),
        }))
    }
}

/// Service, ACL and inventory ports that always succeed.
pub(crate) struct StubPlatform {
    pub service: Mutex<ServiceState>,
    pub hardened: Mutex<Vec<String>>,
}

impl Default for StubPlatform {
    fn default() -> Self {
        Self {
            service: Mutex::new(ServiceState::Running),
            hardened: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ServiceController for StubPlatform {
    async fn state(&self, _service: &str) -> Result<ServiceState, PlatformError> {
        Ok(*self.service.lock().unwrap())
    }
}

#[async_trait]
impl AclApplier for StubPlatform {
    async fn harden_path(&self, path: &Path) -> Result<(), PlatformError> {
        self.hardened.lock().unwrap().push(path.display().to_string());
        Ok(())
    }

    async fn harden_service(&self, service: &str) -> Result<(), PlatformError> {
        self.hardened.lock().unwrap().push(service.to_string());
        Ok(())
    }
}

#[async_trait]
impl InventoryProvider for StubPlatform {
    async fn installed_software(&self) -> Result<Vec<SoftwareEntry>, PlatformError> {
        Ok(Vec::new())
    }

    async fn services(&self) -> Result<Vec<ServiceEntry>, PlatformError> {
        Ok(Vec::new())
    }
}
