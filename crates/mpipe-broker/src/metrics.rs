//! Pipe health metrics and the periodic cluster report
//!
//! The aggregator is constructed once per broker and shared by reference.
//! Counters here are observational; delivery decisions never read them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MetricsThresholds;
use crate::pipe::Pipe;
use crate::types::{ClientId, PipeName};

/// Health bucket, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeHealth {
    Healthy,
    Caution,
    Warning,
    Critical,
    Stalled,
}

impl PipeHealth {
    pub const ALL: [PipeHealth; 5] = [
        PipeHealth::Healthy,
        PipeHealth::Caution,
        PipeHealth::Warning,
        PipeHealth::Critical,
        PipeHealth::Stalled,
    ];

    /// Bucket a pipe by backlog and idle time
    pub fn classify(queue_size: usize, idle: Duration, thresholds: &MetricsThresholds) -> Self {
        let idle_secs = idle.as_secs();
        let backlog = queue_size > 0;

        if backlog && idle_secs >= thresholds.stalled_idle_secs {
            PipeHealth::Stalled
        } else if queue_size >= thresholds.critical_queue_size
            || (backlog && idle_secs >= thresholds.critical_idle_secs)
        {
            PipeHealth::Critical
        } else if queue_size >= thresholds.warning_queue_size
            || (backlog && idle_secs >= thresholds.warning_idle_secs)
        {
            PipeHealth::Warning
        } else if queue_size >= thresholds.caution_queue_size {
            PipeHealth::Caution
        } else {
            PipeHealth::Healthy
        }
    }

    pub fn is_problem(&self) -> bool {
        *self >= PipeHealth::Warning
    }
}

impl fmt::Display for PipeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PipeHealth::Healthy => "healthy",
            PipeHealth::Caution => "caution",
            PipeHealth::Warning => "warning",
            PipeHealth::Critical => "critical",
            PipeHealth::Stalled => "stalled",
        };
        write!(f, "{}", label)
    }
}

/// One pipe at one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeMetrics {
    pub name: PipeName,
    pub queue_size: usize,
    pub idle_secs: u64,
    /// Messages put per second since the previous collection
    pub input_rate: f64,
    /// Messages removed per second since the previous collection
    pub output_rate: f64,
    pub total_input: u64,
    pub total_processed: u64,
    pub health: PipeHealth,
}

/// Per-consumer dispatch counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientActivity {
    pub client_id: ClientId,
    pub requests: u64,
    pub succeeded_messages: u64,
    pub failed_messages: u64,
    pub last_activity: DateTime<Utc>,
}

/// Cluster-wide health summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub generated_at: DateTime<Utc>,
    pub total_pipes: usize,
    pub buckets: Vec<(PipeHealth, usize)>,
    pub total_queue_depth: usize,
    pub average_queue_depth: f64,
    /// Warning and worse, by severity then backlog
    pub problem_pipes: Vec<PipeMetrics>,
    pub top_backlog: Vec<PipeMetrics>,
    /// By combined input and output rate
    pub top_traffic: Vec<PipeMetrics>,
    pub dropped_messages: u64,
    pub clients: Vec<ClientActivity>,
}

impl ClusterReport {
    pub fn from_metrics(
        mut pipes: Vec<PipeMetrics>,
        top_n: usize,
        dropped_messages: u64,
        clients: Vec<ClientActivity>,
    ) -> Self {
        let total_pipes = pipes.len();
        let total_queue_depth: usize = pipes.iter().map(|p| p.queue_size).sum();
        let average_queue_depth = if total_pipes == 0 {
            0.0
        } else {
            total_queue_depth as f64 / total_pipes as f64
        };

        let buckets = PipeHealth::ALL
            .iter()
            .map(|health| (*health, pipes.iter().filter(|p| p.health == *health).count()))
            .collect();

        let mut problem_pipes: Vec<PipeMetrics> =
            pipes.iter().filter(|p| p.health.is_problem()).cloned().collect();
        problem_pipes.sort_by(|a, b| {
            b.health
                .cmp(&a.health)
                .then(b.queue_size.cmp(&a.queue_size))
                .then(a.name.cmp(&b.name))
        });
        problem_pipes.truncate(top_n);

        let mut top_traffic = pipes.clone();
        top_traffic.sort_by(|a, b| {
            let ta = a.input_rate + a.output_rate;
            let tb = b.input_rate + b.output_rate;
            tb.total_cmp(&ta).then(a.name.cmp(&b.name))
        });
        top_traffic.truncate(top_n);

        pipes.sort_by(|a, b| b.queue_size.cmp(&a.queue_size).then(a.name.cmp(&b.name)));
        pipes.truncate(top_n);

        Self {
            generated_at: Utc::now(),
            total_pipes,
            buckets,
            total_queue_depth,
            average_queue_depth,
            problem_pipes,
            top_backlog: pipes,
            top_traffic,
            dropped_messages,
            clients,
        }
    }

    pub fn count(&self, health: PipeHealth) -> usize {
        self.buckets
            .iter()
            .find(|(h, _)| *h == health)
            .map_or(0, |(_, n)| *n)
    }

    /// Share of pipes in a bucket, 0..=100
    pub fn percentage(&self, health: PipeHealth) -> f64 {
        if self.total_pipes == 0 {
            return 0.0;
        }
        self.count(health) as f64 * 100.0 / self.total_pipes as f64
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cluster report at {}: {} pipes, depth total {} avg {:.1}, dropped {}",
            self.generated_at.format("%Y-%m-%d %H:%M:%S"),
            self.total_pipes,
            self.total_queue_depth,
            self.average_queue_depth,
            self.dropped_messages
        )?;
        for health in PipeHealth::ALL {
            writeln!(
                f,
                "  {:<8} {:>5} ({:>5.1}%)",
                health.to_string(),
                self.count(health),
                self.percentage(health)
            )?;
        }
        if !self.problem_pipes.is_empty() {
            writeln!(f, "  problem pipes:")?;
            for p in &self.problem_pipes {
                writeln!(
                    f,
                    "    {} [{}] size={} idle={}s",
                    p.name, p.health, p.queue_size, p.idle_secs
                )?;
            }
        }
        if !self.top_backlog.is_empty() {
            writeln!(f, "  top backlog:")?;
            for p in &self.top_backlog {
                writeln!(f, "    {} size={}", p.name, p.queue_size)?;
            }
        }
        if !self.top_traffic.is_empty() {
            writeln!(f, "  top traffic:")?;
            for p in &self.top_traffic {
                writeln!(
                    f,
                    "    {} in={:.2}/s out={:.2}/s",
                    p.name, p.input_rate, p.output_rate
                )?;
            }
        }
        Ok(())
    }
}

struct Snapshot {
    at: Instant,
    total_input: u64,
    total_processed: u64,
}

struct PipeMonitor {
    pipe: Weak<Pipe>,
    previous: Mutex<Snapshot>,
}

/// Collects per-pipe metrics and builds cluster reports
pub struct MetricsAggregator {
    thresholds: MetricsThresholds,
    pipes: DashMap<PipeName, PipeMonitor>,
    clients: DashMap<ClientId, ClientActivity>,
    dropped_messages: AtomicU64,
}

impl MetricsAggregator {
    pub fn new(thresholds: MetricsThresholds) -> Self {
        Self {
            thresholds,
            pipes: DashMap::new(),
            clients: DashMap::new(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> &MetricsThresholds {
        &self.thresholds
    }

    /// Start monitoring a pipe; replaces an earlier pipe of the same name
    pub fn register(&self, pipe: &Arc<Pipe>) {
        let monitor = PipeMonitor {
            pipe: Arc::downgrade(pipe),
            previous: Mutex::new(Snapshot {
                at: Instant::now(),
                total_input: pipe.total_input_count(),
                total_processed: pipe.total_process_count(),
            }),
        };
        self.pipes.insert(pipe.name().clone(), monitor);
    }

    pub fn unregister(&self, name: &PipeName) {
        self.pipes.remove(name);
    }

    pub fn monitored_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Fire-and-forget dispatch counter
    pub fn record_client_activity(&self, client_id: &ClientId, succeeded: usize, failed: usize) {
        let mut entry = self
            .clients
            .entry(client_id.clone())
            .or_insert_with(|| ClientActivity {
                client_id: client_id.clone(),
                requests: 0,
                succeeded_messages: 0,
                failed_messages: 0,
                last_activity: Utc::now(),
            });
        entry.requests = entry.requests.saturating_add(1);
        entry.succeeded_messages = entry.succeeded_messages.saturating_add(succeeded as u64);
        entry.failed_messages = entry.failed_messages.saturating_add(failed as u64);
        entry.last_activity = Utc::now();
    }

    /// Fire-and-forget drop counter
    pub fn record_dropped_message(&self, pipe: &PipeName) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        debug!(pipe = %pipe, "Message dropped");
    }

    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn client_activity(&self, client_id: &ClientId) -> Option<ClientActivity> {
        self.clients.get(client_id).map(|a| a.value().clone())
    }

    /// Keep activity only for clients `keep` accepts; returns how many went
    pub fn retain_clients(&self, keep: impl Fn(&ClientId) -> bool) -> usize {
        let before = self.clients.len();
        self.clients.retain(|id, _| keep(id));
        before.saturating_sub(self.clients.len())
    }

    /// Measure every live pipe, dropping stopped or released ones
    pub async fn collect(&self) -> Vec<PipeMetrics> {
        let mut live = Vec::new();
        let mut gone = Vec::new();
        for entry in self.pipes.iter() {
            match entry.pipe.upgrade() {
                Some(pipe) if !pipe.is_monitor_stopped() => live.push(pipe),
                _ => gone.push(entry.key().clone()),
            }
        }
        for name in gone {
            debug!(pipe = %name, "Pipe no longer monitored");
            self.pipes.remove(&name);
        }

        let mut metrics = Vec::with_capacity(live.len());
        for pipe in live {
            let queue_size = pipe.size().await;
            let idle = pipe.idle_time();
            let total_input = pipe.total_input_count();
            let total_processed = pipe.total_process_count();

            let (input_rate, output_rate) = match self.pipes.get(pipe.name()) {
                Some(monitor) => {
                    let mut previous = monitor
                        .previous
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let now = Instant::now();
                    let elapsed = now.duration_since(previous.at).as_secs_f64();
                    let rates = if elapsed > 0.0 {
                        (
                            total_input.saturating_sub(previous.total_input) as f64 / elapsed,
                            total_processed.saturating_sub(previous.total_processed) as f64
                                / elapsed,
                        )
                    } else {
                        (0.0, 0.0)
                    };
                    *previous = Snapshot {
                        at: now,
                        total_input,
                        total_processed,
                    };
                    rates
                }
                None => (0.0, 0.0),
            };

            metrics.push(PipeMetrics {
                name: pipe.name().clone(),
                queue_size,
                idle_secs: idle.as_secs(),
                input_rate,
                output_rate,
                total_input,
                total_processed,
                health: PipeHealth::classify(queue_size, idle, &self.thresholds),
            });
        }
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Collect and summarize
    pub async fn report(&self) -> ClusterReport {
        let pipes = self.collect().await;
        let mut clients: Vec<ClientActivity> =
            self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        ClusterReport::from_metrics(
            pipes,
            self.thresholds.report_top_n,
            self.dropped_messages(),
            clients,
        )
    }

    /// Log a report every `interval` until `stop` flips to true
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticks.tick() => {
                        let report = aggregator.report().await;
                        info!(
                            pipes = report.total_pipes,
                            depth = report.total_queue_depth,
                            "{}",
                            report
                        );
                        for problem in &report.problem_pipes {
                            warn!(
                                pipe = %problem.name,
                                health = %problem.health,
                                size = problem.queue_size,
                                idle_secs = problem.idle_secs,
                                "Problem pipe"
                            );
                        }
                    }
                }
            }
            debug!("Metrics reporter stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagePipeConfiguration;
    use crate::message::Message;
    use crate::store::InMemoryStore;

    fn thresholds() -> MetricsThresholds {
        MetricsThresholds {
            caution_queue_size: 10,
            warning_queue_size: 100,
            critical_queue_size: 1000,
            warning_idle_secs: 60,
            critical_idle_secs: 120,
            stalled_idle_secs: 300,
            report_top_n: 2,
        }
    }

    fn metric(name: &str, size: usize, health: PipeHealth, rate: f64) -> PipeMetrics {
        PipeMetrics {
            name: PipeName::parse(name).unwrap(),
            queue_size: size,
            idle_secs: 0,
            input_rate: rate,
            output_rate: 0.0,
            total_input: 0,
            total_processed: 0,
            health,
        }
    }

    #[test]
    fn test_classify_buckets() {
        let t = thresholds();
        let secs = Duration::from_secs;
        assert_eq!(PipeHealth::classify(0, secs(10_000), &t), PipeHealth::Healthy);
        assert_eq!(PipeHealth::classify(5, secs(0), &t), PipeHealth::Healthy);
        assert_eq!(PipeHealth::classify(10, secs(0), &t), PipeHealth::Caution);
        assert_eq!(PipeHealth::classify(100, secs(0), &t), PipeHealth::Warning);
        assert_eq!(PipeHealth::classify(1, secs(60), &t), PipeHealth::Warning);
        assert_eq!(PipeHealth::classify(1000, secs(0), &t), PipeHealth::Critical);
        assert_eq!(PipeHealth::classify(1, secs(120), &t), PipeHealth::Critical);
        assert_eq!(PipeHealth::classify(1, secs(300), &t), PipeHealth::Stalled);
    }

    #[test]
    fn test_report_sections() {
        let report = ClusterReport::from_metrics(
            vec![
                metric("a", 5, PipeHealth::Healthy, 9.0),
                metric("b", 150, PipeHealth::Warning, 1.0),
                metric("c", 2000, PipeHealth::Critical, 0.5),
                metric("d", 3, PipeHealth::Stalled, 0.0),
            ],
            2,
            7,
            Vec::new(),
        );

        assert_eq!(report.total_pipes, 4);
        assert_eq!(report.total_queue_depth, 2158);
        assert!((report.average_queue_depth - 539.5).abs() < f64::EPSILON);
        assert_eq!(report.count(PipeHealth::Warning), 1);
        assert!((report.percentage(PipeHealth::Healthy) - 25.0).abs() < f64::EPSILON);

        let problems: Vec<&str> = report.problem_pipes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(problems, vec!["d", "c"]);
        let backlog: Vec<&str> = report.top_backlog.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(backlog, vec!["c", "b"]);
        let traffic: Vec<&str> = report.top_traffic.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(traffic, vec!["a", "b"]);

        let text = report.to_string();
        assert!(text.contains("4 pipes"));
        assert!(text.contains("problem pipes:"));
    }

    #[test]
    fn test_empty_report() {
        let report = ClusterReport::from_metrics(Vec::new(), 5, 0, Vec::new());
        assert_eq!(report.average_queue_depth, 0.0);
        assert_eq!(report.percentage(PipeHealth::Stalled), 0.0);
    }

    #[test]
    fn test_client_activity_counters() {
        let metrics = MetricsAggregator::new(thresholds());
        let id = ClientId::new("h", 1);
        metrics.record_client_activity(&id, 3, 0);
        metrics.record_client_activity(&id, 0, 2);

        let activity = metrics.client_activity(&id).unwrap();
        assert_eq!(activity.requests, 2);
        assert_eq!(activity.succeeded_messages, 3);
        assert_eq!(activity.failed_messages, 2);
    }

    #[test]
    fn test_retain_clients_prunes_activity() {
        let metrics = MetricsAggregator::new(thresholds());
        let gone = ClientId::new("h", 1);
        let live = ClientId::new("h", 2);
        metrics.record_client_activity(&gone, 1, 0);
        metrics.record_client_activity(&live, 1, 0);

        assert_eq!(metrics.retain_clients(|id| *id == live), 1);
        assert!(metrics.client_activity(&gone).is_none());
        assert!(metrics.client_activity(&live).is_some());
    }

    #[tokio::test]
    async fn test_collect_measures_and_prunes() {
        let metrics = Arc::new(MetricsAggregator::new(thresholds()));
        let store = Arc::new(InMemoryStore::new());
        let pipe = Arc::new(Pipe::new(
            PipeName::parse("orders").unwrap(),
            store,
            Arc::new(MessagePipeConfiguration::new()),
            Arc::clone(&metrics),
        ));
        metrics.register(&pipe);
        for _ in 0..12 {
            pipe.put(Message::new("x")).await;
        }

        let collected = metrics.collect().await;
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].queue_size, 12);
        assert_eq!(collected[0].total_input, 12);
        assert_eq!(collected[0].health, PipeHealth::Caution);
        assert!(collected[0].input_rate > 0.0);

        pipe.stop();
        assert!(metrics.collect().await.is_empty());
        assert_eq!(metrics.monitored_pipes(), 0);
    }
}
