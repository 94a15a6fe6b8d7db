//! Demonstration scenarios
//!
//! Each scenario builds two components on a fresh in-memory naming service, lets them
//! talk through one pattern, then shuts both down and reports what happened.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use commkit_core::{ActiveQueueStats, OverflowPolicy, QueryFailure};
use commkit_runtime::{
    handler_fn, query_handler_fn, Component, InMemoryNamingService, ShutdownReport,
};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// Upper bound on waiting for a stream to drain before shutting down
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// Scenario Results
// ----------------------------------------------------------------------------

/// Outcome of the ping scenario
#[derive(Debug, Clone, Default)]
pub struct PingSummary {
    pub answered: usize,
    pub failed: usize,
    pub round_trips: Vec<Duration>,
}

impl PingSummary {
    pub fn mean_round_trip(&self) -> Option<Duration> {
        if self.round_trips.is_empty() {
            return None;
        }
        let total: Duration = self.round_trips.iter().sum();
        Some(total / self.round_trips.len() as u32)
    }
}

impl fmt::Display for PingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "answered: {}, failed: {}", self.answered, self.failed)?;
        if let Some(mean) = self.mean_round_trip() {
            write!(f, ", mean round trip: {:?}", mean)?;
        }
        Ok(())
    }
}

/// Outcome of the stream scenario
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub policy: Option<OverflowPolicy>,
    pub sent: u64,
    pub send_failures: u64,
    pub handled: u64,
    pub queue: ActiveQueueStats,
}

impl fmt::Display for StreamSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(policy) = self.policy {
            writeln!(f, "policy:        {}", policy)?;
        }
        writeln!(f, "sent:          {}", self.sent)?;
        writeln!(f, "send failures: {}", self.send_failures)?;
        writeln!(f, "handled:       {}", self.handled)?;
        writeln!(f, "enqueued:      {}", self.queue.enqueued)?;
        writeln!(f, "delivered:     {}", self.queue.delivered)?;
        writeln!(f, "dropped:       {}", self.queue.dropped)?;
        writeln!(f, "rejected:      {}", self.queue.rejected)?;
        write!(f, "discarded:     {}", self.queue.discarded)
    }
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

/// Scenario runner over one configuration
pub struct CommkitApp {
    config: AppConfig,
}

impl CommkitApp {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Build the server and client components on a fresh naming service
    fn components(&self) -> Result<(Component, Component)> {
        let naming = InMemoryNamingService::shared();
        let server = Component::builder(self.config.demo.server.clone())
            .with_config(self.config.comm.clone())
            .with_naming(naming.clone())
            .build()?;
        let client = Component::builder(self.config.demo.client.clone())
            .with_config(self.config.comm.clone())
            .with_naming(naming)
            .build()?;
        server.start()?;
        client.start()?;
        Ok((server, client))
    }

    /// Issue `count` "ping" queries and expect "pong" for each
    pub async fn run_ping(&self, count: usize, timeout: Option<Duration>) -> Result<PingSummary> {
        let demo = &self.config.demo;
        let timeout = timeout.unwrap_or_else(|| self.config.comm.query.default_timeout());
        let (server, client) = self.components()?;

        let query_server = server.query_server::<String, String>(&demo.query_service)?;
        query_server.register_handler(query_handler_fn(|request: &String| {
            match request.as_str() {
                "ping" => Ok("pong".to_string()),
                other => Err(QueryFailure::Handler(format!("unexpected request '{other}'"))),
            }
        }));

        let query_client = client
            .connected_query_client::<String, String>(&demo.server, &demo.query_service)
            .await?;
        info!(
            server = %demo.server,
            service = %demo.query_service,
            count,
            timeout_ms = timeout.as_millis() as u64,
            "Running ping scenario"
        );

        let mut summary = PingSummary::default();
        for sequence in 0..count {
            let started = Instant::now();
            match query_client.query("ping".to_string(), timeout).await {
                Ok(answer) if answer == "pong" => {
                    let elapsed = started.elapsed();
                    debug!(sequence, elapsed_us = elapsed.as_micros() as u64, "pong");
                    summary.answered += 1;
                    summary.round_trips.push(elapsed);
                }
                Ok(answer) => {
                    warn!(sequence, %answer, "Unexpected answer");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(sequence, error = %e, "Ping failed");
                    summary.failed += 1;
                }
            }
        }

        log_report(&client.shutdown().await?);
        log_report(&server.shutdown().await?);
        Ok(summary)
    }

    /// Push `count` samples into a consumer whose handler sits behind an active queue
    pub async fn run_stream(
        &self,
        count: u64,
        policy: Option<OverflowPolicy>,
        work: Duration,
    ) -> Result<StreamSummary> {
        let demo = &self.config.demo;
        let mut queue_config = self.config.comm.queue.clone();
        if let Some(policy) = policy {
            queue_config.overflow = policy;
        }
        let policy = queue_config.overflow;
        let (server, client) = self.components()?;

        let push_server = server.push_server::<u64>(&demo.push_service)?;
        let handled = Arc::new(AtomicU64::new(0));
        let handler_count = handled.clone();
        let id = push_server.register_handler(handler_fn(move |_sample: &u64| {
            if !work.is_zero() {
                std::thread::sleep(work);
            }
            handler_count.fetch_add(1, Ordering::SeqCst);
        }));
        let queue = push_server
            .subject()
            .decorate_active_queue(id, queue_config)?;

        let push_client = client
            .connected_push_client::<u64>(&demo.server, &demo.push_service)
            .await?;
        info!(
            server = %demo.server,
            service = %demo.push_service,
            count,
            %policy,
            "Running stream scenario"
        );

        let mut summary = StreamSummary {
            policy: Some(policy),
            ..StreamSummary::default()
        };
        for sample in 0..count {
            match push_client.send(sample).await {
                Ok(()) => summary.sent += 1,
                Err(e) => {
                    warn!(sample, error = %e, "Send failed");
                    summary.send_failures += 1;
                }
            }
        }

        let deadline = Instant::now() + DRAIN_DEADLINE;
        loop {
            let drained = push_server.received() >= summary.sent && queue.buffered() == 0;
            if drained {
                break;
            }
            if Instant::now() >= deadline {
                return Err(CliError::Scenario(format!(
                    "stream did not drain within {:?}",
                    DRAIN_DEADLINE
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // An item still inside the handler completes before the queue worker joins.
        log_report(&client.shutdown().await?);
        log_report(&server.shutdown().await?);
        summary.handled = handled.load(Ordering::SeqCst);
        summary.queue = queue.stats();
        Ok(summary)
    }
}

fn log_report(report: &ShutdownReport) {
    if report.is_clean() {
        info!(
            component = %report.component,
            tasks = report.tasks_stopped,
            patterns = report.patterns_closed,
            observers = report.observers_notified,
            "Component shut down"
        );
    } else {
        warn!(
            component = %report.component,
            task_failures = report.task_failures.len(),
            pattern_failures = report.pattern_failures.len(),
            observer_timeouts = report.observer_timeouts.len(),
            "Component shut down with failures"
        );
    }
}
