//! Agent lifecycle: wires every unit onto one queue and one cancellation token,
//! starts them in order and stops them within the shutdown grace period.

use crate::client::{ClientError, HttpServerApi, ServerApi};
use crate::collectors::software::HttpApprovalGateway;
use crate::collectors::{Collector, HostContext, SoftwareControl};
use crate::config::AgentConfig;
use crate::inventory::InventoryScanner;
use crate::platform::{self, AclApplier, EventSource, FileHasher, InventoryProvider, ServiceController};
use crate::protection::alerts::QueueAlertSink;
use crate::protection::Supervisor;
use crate::queue::EventQueue;
use crate::registration::{self, Heartbeat, SystemInfo};
use crate::scripts::ScriptRunner;
use crate::sender::BatchSender;
use crate::state::{AgentIdentity, SharedState, Stats};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("agent cannot start from state {0}")]
    InvalidState(AgentState),
}

/// Everything the agent talks to outside its own process.
#[derive(Clone)]
pub struct AgentPorts {
    pub api: Arc<dyn ServerApi>,
    pub source: Arc<dyn EventSource>,
    pub services: Arc<dyn ServiceController>,
    pub acl: Arc<dyn AclApplier>,
    pub hasher: Arc<dyn FileHasher>,
    pub inventory: Arc<dyn InventoryProvider>,
}

impl AgentPorts {
    /// HTTP server client plus the adapters for the current platform.
    pub fn platform(config: &AgentConfig) -> Result<Self, ClientError> {
        Ok(Self {
            api: Arc::new(HttpServerApi::new(&config.server)?),
            source: platform::default_event_source(),
            services: platform::default_service_controller(),
            acl: platform::default_acl_applier(),
            hasher: platform::default_file_hasher(),
            inventory: platform::default_inventory_provider(),
        })
    }
}

pub struct Agent {
    config: AgentConfig,
    ports: AgentPorts,
    system: SystemInfo,
    protected_paths: Vec<PathBuf>,
    shared: SharedState,
    state: AgentState,
    cancel: CancellationToken,
    /// Cancelled only after the collector has stopped, so the sender sees every queued event
    sender_cancel: CancellationToken,
    collector: Option<Collector>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        ports: AgentPorts,
        system: SystemInfo,
        protected_paths: Vec<PathBuf>,
    ) -> Self {
        let shared = SharedState::new(AgentIdentity::new(system.hostname.clone()));
        Self {
            config,
            ports,
            system,
            protected_paths,
            shared,
            state: AgentState::Created,
            cancel: CancellationToken::new(),
            sender_cancel: CancellationToken::new(),
            collector: None,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.shared.snapshot()
    }

    pub fn shared_state(&self) -> SharedState {
        self.shared.clone()
    }

    fn spawn<F>(&mut self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(unit = name, "starting");
        self.tasks.push((name, tokio::spawn(fut)));
    }

    /// Register (best-effort) and start every enabled unit.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        if self.state != AgentState::Created {
            return Err(LifecycleError::InvalidState(self.state));
        }
        self.state = AgentState::Starting;
        info!(hostname = %self.system.hostname, version = %self.shared.identity().version, "agent starting");

        registration::register(self.ports.api.as_ref(), &self.shared, self.system.clone()).await;

        let (producer, consumer) = EventQueue::new(self.config.queue.capacity);
        let host = HostContext {
            hostname: self.system.hostname.clone(),
            fqdn: self.system.fqdn.clone(),
            ip_address: self.system.ip_address.clone(),
        };

        let software = if self.config.software_control.enabled {
            Some(Arc::new(SoftwareControl::new(
                self.config.software_control.clone(),
                Arc::new(HttpApprovalGateway::new(self.ports.api.clone())),
                self.shared.clone(),
            )))
        } else {
            None
        };

        if self.config.collector.enabled {
            let mut collector = Collector::new(
                self.config.collector.clone(),
                self.ports.source.clone(),
                producer.clone(),
                self.shared.clone(),
                host,
            );
            if let Some(sc) = &software {
                collector.add_inspector(sc.clone());
            }
            collector.start(&self.cancel);
            self.collector = Some(collector);
        }

        let sender = BatchSender::new(
            self.config.sender.clone(),
            self.ports.api.clone(),
            self.shared.clone(),
        );
        let sender_cancel = self.sender_cancel.clone();
        self.spawn("sender", sender.run(consumer, sender_cancel));

        let heartbeat = Heartbeat::new(
            self.config.heartbeat.clone(),
            self.ports.api.clone(),
            self.shared.clone(),
            self.system.ip_address.clone(),
        );
        self.spawn("heartbeat", heartbeat.run(self.cancel.child_token()));

        if self.config.inventory.enabled {
            let scanner = InventoryScanner::new(
                self.config.inventory.clone(),
                self.ports.api.clone(),
                self.ports.inventory.clone(),
                self.shared.clone(),
            );
            self.spawn("inventory", scanner.run(self.cancel.child_token()));
        }

        if let Some(sc) = software {
            self.spawn("software_control", sc.run(self.cancel.child_token()));
        }

        if self.config.scripts.enabled {
            let runner = ScriptRunner::new(
                self.config.scripts.clone(),
                self.ports.api.clone(),
                self.shared.clone(),
            );
            self.spawn("scripts", runner.run(self.cancel.child_token()));
        }

        if self.config.protection.enabled {
            let sink = QueueAlertSink::new(producer.clone(), self.shared.clone(), self.system.hostname.clone());
            let supervisor = Supervisor::new(
                self.config.protection.clone(),
                self.protected_paths.clone(),
                self.ports.hasher.clone(),
                self.ports.services.clone(),
                self.ports.acl.clone(),
                Arc::new(sink),
            );
            self.spawn("supervisor", supervisor.run(self.cancel.child_token()));
        }
        drop(producer);

        self.state = AgentState::Running;
        info!(
            registered = self.shared.is_registered(),
            units = self.tasks.len() + usize::from(self.collector.is_some()),
            "agent running"
        );
        Ok(())
    }

    /// Stop collection, flush what is queued and wait for every unit up to the
    /// shutdown grace period. Units still running after that are aborted.
    pub async fn stop(&mut self) {
        match self.state {
            AgentState::Running => {}
            AgentState::Created => {
                self.state = AgentState::Stopped;
                return;
            }
            _ => return,
        }
        self.state = AgentState::Stopping;
        info!("agent stopping");

        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        self.cancel.cancel();

        if let Some(mut collector) = self.collector.take() {
            if timeout_at(deadline, collector.stop()).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "collector did not stop within grace period");
            }
        }
        self.sender_cancel.cancel();

        let mut aborted = 0usize;
        for (name, mut handle) in self.tasks.drain(..) {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(unit = name, "stopped"),
                Ok(Err(e)) => warn!(unit = name, error = %e, "unit ended abnormally"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                    warn!(unit = name, grace_secs = grace.as_secs(), "unit did not stop within grace period; aborted");
                }
            }
        }

        self.state = AgentState::Stopped;
        let stats = self.shared.snapshot();
        info!(
            aborted,
            events_collected = stats.events_collected,
            events_sent = stats.events_sent,
            events_dropped = stats.events_dropped,
            "agent stopped"
        );
    }

    /// Start, wait for `shutdown`, then stop.
    pub async fn run_until(&mut self, shutdown: CancellationToken) -> Result<(), LifecycleError> {
        self.start().await?;
        shutdown.cancelled().await;
        self.stop().await;
        Ok(())
    }
}
