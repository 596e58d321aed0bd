//! Remote script execution over the pull-based command channel.

use crate::client::ServerApi;
use crate::config::ScriptConfig;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingScript {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub content: String,
    /// Overrides the configured timeout when set
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptResult {
    pub script_id: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Lossy UTF-8, cut to at most `MAX_OUTPUT_BYTES` on a char boundary.
pub fn truncate_output(bytes: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(bytes).into_owned();
    if s.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

pub struct ScriptRunner {
    config: ScriptConfig,
    api: Arc<dyn ServerApi>,
    state: SharedState,
}

impl ScriptRunner {
    pub fn new(config: ScriptConfig, api: Arc<dyn ServerApi>, state: SharedState) -> Self {
        Self { config, api, state }
    }

    fn timeout_for(&self, script: &PendingScript) -> Duration {
        let secs = script
            .timeout_secs
            .filter(|s| *s > 0)
            .unwrap_or(self.config.timeout_secs)
            .max(1);
        Duration::from_secs(secs)
    }

    /// Run one script with the configured interpreter. The child is killed on timeout.
    pub async fn execute(&self, script: &PendingScript) -> ScriptResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = ScriptResult {
            script_id: script.id.clone(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            timed_out: false,
            error: None,
            started_at,
            finished_at: started_at,
        };

        let child = Command::new(&self.config.interpreter)
            .args(&self.config.interpreter_args)
            .arg(&script.content)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match child {
            Err(e) => result.error = Some(format!("spawn {}: {}", self.config.interpreter, e)),
            Ok(child) => {
                match tokio::time::timeout(self.timeout_for(script), child.wait_with_output()).await {
                    Ok(Ok(out)) => {
                        result.exit_code = out.status.code();
                        result.stdout = truncate_output(&out.stdout);
                        result.stderr = truncate_output(&out.stderr);
                    }
                    Ok(Err(e)) => result.error = Some(e.to_string()),
                    Err(_) => {
                        result.timed_out = true;
                        result.error = Some("timed out".to_string());
                    }
                }
            }
        }

        result.duration_ms = clock.elapsed().as_millis() as u64;
        result.finished_at = Utc::now();
        result
    }

    /// Fetch and run everything pending. Returns how many scripts ran.
    pub async fn poll_once(&self) -> usize {
        if !self.state.is_registered() {
            return 0;
        }
        let agent_id = self.state.agent_id();
        let scripts = match self.api.pending_scripts(&agent_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "script poll failed");
                return 0;
            }
        };
        for script in &scripts {
            info!(script_id = %script.id, name = %script.name, "running script");
            let result = self.execute(script).await;
            info!(
                script_id = %script.id,
                exit_code = ?result.exit_code,
                timed_out = result.timed_out,
                duration_ms = result.duration_ms,
                "script finished"
            );
            if let Err(e) = self.api.report_script_result(&agent_id, &result).await {
                warn!(script_id = %script.id, error = %e, "script result upload failed");
            }
        }
        scripts.len()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
        debug!("script runner stopped");
    }
}
