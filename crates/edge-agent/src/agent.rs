//! Store-and-Forward Agent
//!
//! Online: submit each sample with bounded retries, going Offline and
//! buffering once they are exhausted. Offline: buffer every sample and
//! probe periodically. Draining: replay the buffer oldest-first, one
//! acknowledged item at a time, with new samples queued behind it.
//!
//! All network work in a tick must finish within one sample interval, so
//! a slow server delays delivery but never the sampling cadence.

use crate::client::{ClientError, IngestClient};
use crate::config::AgentConfig;
use crate::sensor::{Sensor, SensorError};
use ingestion::{MetricValue, Reading};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storage::{EnqueueOutcome, OfflineQueue, QueueError};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Online,
    Offline,
    Draining,
}

/// What one sampling tick did
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub state_before: AgentState,
    pub state_after: AgentState,
    /// Idempotency token of the sample taken this tick
    pub token: String,
    /// Readings acknowledged by the server (live or replayed)
    pub delivered: usize,
    /// Readings the server refused and that were discarded
    pub dropped: usize,
    /// The tick's sample went into the queue
    pub buffered: bool,
    /// Sequence numbers evicted under the drop-oldest policy
    pub evicted: Vec<u64>,
    pub queue_len: usize,
}

/// Shared stop switch for a running agent
#[derive(Debug, Clone)]
pub struct AgentHandle {
    stop: Arc<AtomicBool>,
}

impl AgentHandle {
    pub fn stop(&self) {
        info!("Stopping edge agent");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Edge agent driving one sensor
pub struct EdgeAgent<C: IngestClient> {
    config: AgentConfig,
    sensor: Box<dyn Sensor>,
    client: C,
    queue: Arc<dyn OfflineQueue>,
    state: AgentState,
    last_probe: Option<Instant>,
    stop: Arc<AtomicBool>,
}

impl<C: IngestClient> EdgeAgent<C> {
    /// Create an agent. A non-empty persisted queue starts it in Draining
    /// so live readings never overtake the backlog.
    pub fn new(
        config: AgentConfig,
        sensor: Box<dyn Sensor>,
        client: C,
        queue: Arc<dyn OfflineQueue>,
    ) -> Result<Self, AgentError> {
        let backlog = queue.len()?;
        let state = if backlog > 0 {
            info!("Found {} buffered readings, starting in Draining", backlog);
            AgentState::Draining
        } else {
            AgentState::Online
        };

        info!(
            "Creating edge agent for {} / {} ({:?})",
            config.subject_id, config.sensor_id, state
        );
        Ok(Self {
            config,
            sensor,
            client,
            queue,
            state,
            last_probe: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            stop: self.stop.clone(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn transition(&mut self, next: AgentState) {
        if self.state != next {
            info!("Edge agent {:?} -> {:?}", self.state, next);
            if next == AgentState::Offline {
                self.last_probe = Some(Instant::now());
            }
            self.state = next;
        }
    }

    /// Sample the sensor once and act on the reading according to the
    /// current state.
    pub async fn tick(&mut self) -> Result<TickReport, AgentError> {
        let deadline = Instant::now() + self.config.sample_interval();
        let state_before = self.state;
        let reading = self.sample()?;
        let token = reading.idempotency_token.clone().unwrap_or_default();
        let mut report = TickReport {
            state_before,
            state_after: state_before,
            token,
            delivered: 0,
            dropped: 0,
            buffered: false,
            evicted: Vec::new(),
            queue_len: 0,
        };

        // A sample that cannot be buffered is lost on its own; the backlog
        // still drains and the error is returned once the tick is done.
        let mut buffer_error = None;
        match self.state {
            AgentState::Online => self.deliver_live(&reading, &mut report, deadline).await?,
            AgentState::Offline => {
                buffer_error = self.buffer(&reading, &mut report).err();
                if self.probe_due() && self.probe().await {
                    self.transition(AgentState::Draining);
                    self.drain(&mut report, deadline).await?;
                }
            }
            AgentState::Draining => {
                buffer_error = self.buffer(&reading, &mut report).err();
                self.drain(&mut report, deadline).await?;
            }
        }

        report.state_after = self.state;
        report.queue_len = self.queue.len()?;
        debug!("Tick: {:?}", report);
        match buffer_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Whether a submission started now would finish by `deadline`
    fn fits(&self, deadline: Instant, wait: Duration) -> bool {
        Instant::now() + wait + self.config.submit_timeout() <= deadline
    }

    /// Tick on the configured cadence until stopped
    pub async fn run(&mut self) -> Result<(), AgentError> {
        info!(
            "Starting edge agent loop every {:?}",
            self.config.sample_interval()
        );
        let mut interval = tokio::time::interval(self.config.sample_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopped() {
            interval.tick().await;
            if self.stopped() {
                break;
            }
            if let Err(e) = self.tick().await {
                error!("Edge agent tick failed: {}", e);
            }
        }

        info!("Edge agent stopped in {:?}", self.state);
        Ok(())
    }

    fn sample(&mut self) -> Result<Reading, AgentError> {
        let sample = self.sensor.sample()?;
        let mut reading = Reading::new(
            self.config.subject_id.clone(),
            self.config.sensor_id.clone(),
            self.config.location.clone(),
        )
        .with_captured_at(sample.captured_at)
        .with_token(Uuid::new_v4().to_string());
        for (name, value) in sample.metrics {
            reading.metrics.insert(name, MetricValue::Number(value));
        }
        Ok(reading)
    }

    async fn submit(&self, reading: &Reading) -> Result<(), ClientError> {
        let timeout = self.config.submit_timeout();
        match tokio::time::timeout(timeout, self.client.submit(reading)).await {
            Ok(Ok(outcome)) => {
                debug!(
                    "Delivered reading #{} ({}) for {}",
                    outcome.ledger_index, outcome.severity, outcome.subject_id
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Timeout(self.config.submit_timeout_ms)),
        }
    }

    async fn deliver_live(
        &mut self,
        reading: &Reading,
        report: &mut TickReport,
        deadline: Instant,
    ) -> Result<(), AgentError> {
        let attempts = self.config.submit_attempts.max(1);
        let backoff = self.config.retry_backoff();
        for attempt in 1..=attempts {
            if attempt > 1 {
                if !self.fits(deadline, backoff) {
                    debug!("No time left this tick for attempt {}", attempt);
                    break;
                }
                tokio::time::sleep(backoff).await;
            }
            match self.submit(reading).await {
                Ok(()) => {
                    report.delivered += 1;
                    return Ok(());
                }
                Err(ClientError::Rejected(reason)) => {
                    error!("Reading rejected by server, dropping: {}", reason);
                    report.dropped += 1;
                    return Ok(());
                }
                Err(e) => {
                    warn!("Submit attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }

        self.transition(AgentState::Offline);
        self.buffer(reading, report)
    }

    fn buffer(&mut self, reading: &Reading, report: &mut TickReport) -> Result<(), AgentError> {
        let bytes =
            serde_json::to_vec(reading).map_err(|e| AgentError::Serialization(e.to_string()))?;
        match self.queue.enqueue(bytes) {
            Ok(EnqueueOutcome::Accepted { seq }) => {
                debug!("Buffered reading as seq {}", seq);
            }
            Ok(EnqueueOutcome::Evicted { seq, evicted }) => {
                error!(
                    "Queue full, evicted seq {} ({} attempts) for seq {}",
                    evicted.seq, evicted.attempt_count, seq
                );
                report.evicted.push(evicted.seq);
            }
            Err(e) => {
                error!("Failed to buffer reading {}: {}", report.token, e);
                return Err(e.into());
            }
        }
        report.buffered = true;
        Ok(())
    }

    fn probe_due(&self) -> bool {
        self.last_probe
            .map_or(true, |at| at.elapsed() >= self.config.probe_interval())
    }

    async fn probe(&mut self) -> bool {
        self.last_probe = Some(Instant::now());
        let timeout = self.config.submit_timeout();
        match tokio::time::timeout(timeout, self.client.probe()).await {
            Ok(Ok(())) => {
                info!("Connectivity probe succeeded");
                true
            }
            Ok(Err(e)) => {
                debug!("Connectivity probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Connectivity probe timed out");
                false
            }
        }
    }

    /// Replay up to one batch of queued readings, starting a new item only
    /// while it can finish before `deadline`. At least one item is tried per
    /// tick. Any failure leaves the failing item and everything behind it
    /// queued and returns to Offline.
    async fn drain(
        &mut self,
        report: &mut TickReport,
        deadline: Instant,
    ) -> Result<(), AgentError> {
        let batch = self.config.drain_batch_size.max(1);
        for n in 0..batch {
            if self.stopped() {
                info!("Drain interrupted by stop request");
                return Ok(());
            }
            if n > 0 && !self.fits(deadline, Duration::ZERO) {
                debug!("Drain paused after {} items until the next tick", n);
                return Ok(());
            }
            let Some(item) = self.queue.peek_oldest()? else {
                break;
            };

            let reading: Reading = match serde_json::from_slice(&item.reading) {
                Ok(reading) => reading,
                Err(e) => {
                    error!("Discarding undecodable queued seq {}: {}", item.seq, e);
                    self.queue.remove_oldest()?;
                    report.dropped += 1;
                    continue;
                }
            };

            match self.submit(&reading).await {
                Ok(()) => {
                    self.queue.remove_oldest()?;
                    report.delivered += 1;
                }
                Err(ClientError::Rejected(reason)) => {
                    error!("Queued seq {} rejected by server, dropping: {}", item.seq, reason);
                    self.queue.remove_oldest()?;
                    report.dropped += 1;
                }
                Err(e) => {
                    let attempts = self.queue.record_attempt()?.unwrap_or(0);
                    warn!(
                        "Drain stopped at seq {} (attempt {}): {}",
                        item.seq, attempts, e
                    );
                    self.transition(AgentState::Offline);
                    return Ok(());
                }
            }
        }

        if self.queue.is_empty()? {
            info!("Offline queue drained");
            self.transition(AgentState::Online);
        }
        Ok(())
    }
}
