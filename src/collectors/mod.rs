//! Event collection: one polling loop per event-log channel feeding the shared queue.
//! Installer detection for software control rides along as an [`EventInspector`].

pub mod software;

use crate::config::{ChannelConfig, CollectorConfig};
use crate::event::Event;
use crate::normalizer::Normalizer;
use crate::platform::{ChannelSubscription, EventSource};
use crate::queue::QueueProducer;
use crate::state::SharedState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use software::{InstallRequest, InstallStatus, SoftwareControl};

/// Sees every normalized event before filtering.
pub trait EventInspector: Send + Sync {
    fn inspect(&self, event: &Event);
}

/// Host facts stamped onto every event.
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub hostname: String,
    pub fqdn: String,
    pub ip_address: String,
}

/// What happened to one rendered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Enqueued,
    Excluded,
    BelowSeverity,
    Dropped,
    Skipped,
}

/// Shared pieces every channel loop needs.
#[derive(Clone)]
struct Pipeline {
    producer: QueueProducer,
    state: SharedState,
    host: Arc<HostContext>,
    inspectors: Arc<Vec<Arc<dyn EventInspector>>>,
    normalizer: Normalizer,
}

pub struct ChannelWorker {
    channel: ChannelConfig,
    poll_interval: Duration,
    max_per_tick: usize,
    pipeline: Pipeline,
}

impl ChannelWorker {
    pub fn name(&self) -> &str {
        &self.channel.name
    }

    /// Parse, normalize, filter and enqueue one rendered record.
    pub fn process_record(&self, xml: &str) -> RecordOutcome {
        let p = &self.pipeline;
        let mut ev = match p.normalizer.normalize_xml(xml, &self.channel.name, Utc::now()) {
            Ok(Some(ev)) => ev,
            Ok(None) => return RecordOutcome::Skipped,
            Err(e) => {
                debug!(channel = %self.channel.name, error = %e, "skipping unparsable record");
                return RecordOutcome::Skipped;
            }
        };

        ev.agent_id = p.state.agent_id();
        ev.fqdn = p.host.fqdn.clone();
        ev.ip_address = p.host.ip_address.clone();
        if ev.computer.is_empty() {
            ev.computer = p.host.hostname.clone();
        }
        if ev.has_clock_anomaly() {
            debug!(channel = %self.channel.name, record_id = ev.record_id, "event time ahead of collection time");
        }

        for inspector in p.inspectors.iter() {
            inspector.inspect(&ev);
        }

        if self.channel.exclude_event_ids.contains(&ev.event_code) {
            p.state.record_filtered(1);
            return RecordOutcome::Excluded;
        }
        if self.channel.min_severity > 0 && ev.severity.as_u8() < self.channel.min_severity {
            p.state.record_filtered(1);
            return RecordOutcome::BelowSeverity;
        }

        let code = ev.event_code;
        match p.producer.try_enqueue(ev) {
            Ok(()) => {
                p.state.record_collected(1);
                RecordOutcome::Enqueued
            }
            Err(e) => {
                warn!(channel = %self.channel.name, event_code = code, error = %e, "dropping event");
                p.state.record_dropped(1);
                RecordOutcome::Dropped
            }
        }
    }

    /// Drain up to the per-tick cap from the subscription.
    pub fn drain(&self, sub: &mut dyn ChannelSubscription) -> usize {
        let records = match sub.next_batch(self.max_per_tick) {
            Ok(r) => r,
            Err(e) => {
                warn!(channel = %self.channel.name, error = %e, "channel read failed");
                return 0;
            }
        };
        let mut enqueued = 0;
        for record in records {
            match record {
                Ok(xml) => {
                    if self.process_record(&xml) == RecordOutcome::Enqueued {
                        enqueued += 1;
                    }
                }
                Err(e) => debug!(channel = %self.channel.name, error = %e, "skipping record"),
            }
        }
        enqueued
    }

    pub async fn run(self, source: Arc<dyn EventSource>, cancel: CancellationToken) {
        let mut sub = match source.subscribe(&self.channel.name) {
            Ok(sub) => sub,
            Err(e) => {
                warn!(channel = %self.channel.name, error = %e, "subscription failed, channel disabled");
                return;
            }
        };
        info!(channel = %self.channel.name, "channel subscribed");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.drain(sub.as_mut());
                }
            }
        }
        debug!(channel = %self.channel.name, "channel stopped");
    }
}

pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn EventSource>,
    pipeline: Pipeline,
    inspectors: Vec<Arc<dyn EventInspector>>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        source: Arc<dyn EventSource>,
        producer: QueueProducer,
        state: SharedState,
        host: HostContext,
    ) -> Self {
        Self {
            config,
            source,
            pipeline: Pipeline {
                producer,
                state,
                host: Arc::new(host),
                inspectors: Arc::new(Vec::new()),
                normalizer: Normalizer::new(),
            },
            inspectors: Vec::new(),
            cancel: None,
            tasks: Vec::new(),
        }
    }

    /// Register before `start`; later additions are not seen by running channels.
    pub fn add_inspector(&mut self, inspector: Arc<dyn EventInspector>) {
        self.inspectors.push(inspector);
    }

    /// Worker for one channel, wired to this collector's queue and state.
    pub fn worker(&self, channel: ChannelConfig) -> ChannelWorker {
        let mut pipeline = self.pipeline.clone();
        pipeline.inspectors = Arc::new(self.inspectors.clone());
        ChannelWorker {
            channel,
            poll_interval: self.config.poll_interval().max(Duration::from_millis(10)),
            max_per_tick: self.config.max_events_per_tick.max(1),
            pipeline,
        }
    }

    /// Spawn one task per enabled channel. Stopping `parent` stops them too.
    pub fn start(&mut self, parent: &CancellationToken) {
        if self.cancel.is_some() {
            return;
        }
        let cancel = parent.child_token();
        let channels: Vec<ChannelConfig> = self.config.enabled_channels().cloned().collect();
        for channel in channels {
            let worker = self.worker(channel);
            debug!(channel = %worker.name(), "starting channel");
            self.tasks
                .push(tokio::spawn(worker.run(self.source.clone(), cancel.clone())));
        }
        info!(channels = self.tasks.len(), "collector started");
        self.cancel = Some(cancel);
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }

    /// Cancel every channel loop and wait for all of them.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "channel task ended abnormally");
            }
        }
        info!("collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::SourceError;
    use crate::queue::EventQueue;
    use crate::state::AgentIdentity;
    use crate::testing::FakeSource;
    use std::sync::Mutex;

    fn record(code: u32, level: u8) -> String {
        format!(
            r#"<Event xmlns="http://schemas.microsoft.com/win/2004/08/events/event">
  <System>
    <Provider Name="Microsoft-Windows-Security-Auditing"/>
    <EventID>{code}</EventID>
    <Level>{level}</Level>
    <EventRecordID>1</EventRecordID>
    <Channel>Security</Channel>
    <Computer>ws01.corp.local</Computer>
  </System>
  <EventData><Data Name="SubjectUserName">bob</Data></EventData>
</Event>"#
        )
    }

    fn collector(
        channels: Vec<ChannelConfig>,
        capacity: usize,
        source: FakeSource,
    ) -> (Collector, crate::queue::QueueConsumer, SharedState) {
        let (producer, consumer) = EventQueue::new(capacity);
        let state = SharedState::new(AgentIdentity::new("ws01"));
        let config = CollectorConfig {
            channels,
            ..CollectorConfig::default()
        };
        let host = HostContext {
            hostname: "ws01".into(),
            fqdn: "ws01.corp.local".into(),
            ip_address: "10.0.0.9".into(),
        };
        (
            Collector::new(config, Arc::new(source), producer, state.clone(), host),
            consumer,
            state,
        )
    }

    fn security(exclude: &[u32]) -> ChannelConfig {
        ChannelConfig {
            name: "Security".into(),
            exclude_event_ids: exclude.to_vec(),
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn excluded_codes_never_reach_the_queue() {
        let (c, consumer, state) = collector(vec![], 10, FakeSource::default());
        let worker = c.worker(security(&[5156]));
        for _ in 0..25 {
            assert_eq!(worker.process_record(&record(5156, 4)), RecordOutcome::Excluded);
        }
        drop(consumer);
        assert_eq!(worker.pipeline.producer.len(), 0);
        assert_eq!(state.snapshot().events_filtered, 25);
    }

    #[test]
    fn min_severity_filter() {
        let (c, _consumer, _) = collector(vec![], 10, FakeSource::default());
        let mut ch = security(&[]);
        ch.min_severity = 3;
        let worker = c.worker(ch);
        // Level 4 (information) maps to Info
        assert_eq!(worker.process_record(&record(9999, 4)), RecordOutcome::BelowSeverity);
        assert_eq!(worker.process_record(&record(9999, 2)), RecordOutcome::Enqueued);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (c, _consumer, state) = collector(vec![], 1, FakeSource::default());
        let worker = c.worker(security(&[]));
        assert_eq!(worker.process_record(&record(4624, 4)), RecordOutcome::Enqueued);
        assert_eq!(worker.process_record(&record(4624, 4)), RecordOutcome::Dropped);
        let s = state.snapshot();
        assert_eq!(s.events_collected, 1);
        assert_eq!(s.events_dropped, 1);
    }

    #[test]
    fn stamps_host_and_agent() {
        let (c, mut consumer, state) = collector(vec![], 4, FakeSource::default());
        state.set_agent_id("a-9");
        let worker = c.worker(security(&[]));
        worker.process_record(&record(4624, 4));
        let ev = consumer.try_dequeue().unwrap();
        assert_eq!(ev.agent_id, "a-9");
        assert_eq!(ev.fqdn, "ws01.corp.local");
        assert_eq!(ev.ip_address, "10.0.0.9");
        assert_eq!(ev.computer, "ws01.corp.local");
    }

    #[test]
    fn bad_records_are_skipped_individually() {
        let source = FakeSource::default();
        source.push("Security", Ok(record(4624, 4)));
        source.push("Security", Err(SourceError::Render("boom".into())));
        source.push("Security", Ok("<Event><System>".into()));
        source.push("Security", Ok(record(4634, 4)));
        let (c, mut consumer, _) = collector(vec![], 10, source.clone());
        let worker = c.worker(security(&[]));
        let mut sub = source.subscribe("Security").unwrap();
        assert_eq!(worker.drain(sub.as_mut()), 2);
        let codes: Vec<u32> = std::iter::from_fn(|| consumer.try_dequeue())
            .map(|e| e.event_code)
            .collect();
        assert_eq!(codes, vec![4624, 4634]);
    }

    #[test]
    fn per_tick_cap_is_respected() {
        let source = FakeSource::default();
        for _ in 0..150 {
            source.push("Security", Ok(record(4624, 4)));
        }
        let (c, _consumer, _) = collector(vec![], 500, source.clone());
        let worker = c.worker(security(&[]));
        let mut sub = source.subscribe("Security").unwrap();
        assert_eq!(worker.drain(sub.as_mut()), 100);
        assert_eq!(worker.drain(sub.as_mut()), 50);
    }

    struct Counter(Mutex<Vec<u32>>);

    impl EventInspector for Counter {
        fn inspect(&self, event: &Event) {
            self.0.lock().unwrap().push(event.event_code);
        }
    }

    #[test]
    fn inspectors_see_excluded_events_too() {
        let (mut c, _consumer, _) = collector(vec![], 10, FakeSource::default());
        let counter = Arc::new(Counter(Mutex::new(Vec::new())));
        c.add_inspector(counter.clone());
        let worker = c.worker(security(&[4688]));
        worker.process_record(&record(4688, 4));
        assert_eq!(*counter.0.lock().unwrap(), vec![4688]);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_run_independently_and_stop() {
        let source = FakeSource::default();
        source.push("Security", Ok(record(4624, 4)));
        source.push("System", Ok(record(7036, 4)));
        let channels = vec![
            security(&[]),
            ChannelConfig::named("Broken"),
            ChannelConfig::named("System"),
        ];
        let (mut c, mut consumer, _) = collector(channels, 10, source);
        let cancel = CancellationToken::new();
        c.start(&cancel);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let mut codes: Vec<u32> = std::iter::from_fn(|| consumer.try_dequeue())
            .map(|e| e.event_code)
            .collect();
        codes.sort();
        assert_eq!(codes, vec![4624, 7036]);

        c.stop().await;
        assert!(!c.is_running());
    }
}
