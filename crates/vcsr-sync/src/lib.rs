//! Pass orchestration: fetch with cursor, filter against the ledger,
//! rate-limited delivery with retry and circuit breaking, durable commit.
//!
//! One call to [`SyncPipeline::run_once`] is one pass. Passes are batch,
//! single-worker, and restart-safe: incrementality comes from the ledger
//! plus a recency window, never from cursors or timestamps carried between
//! runs.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;
use vcsr_adapters::{
    sink_for_spec, source_for_spec, FetchFilters, SinkAdapter, SinkSpec, SourceAdapter, SourceSpec,
};
use vcsr_core::{DeliveryOutcome, PassCounts, Record, SinkStatus};
use vcsr_storage::{BackoffPolicy, CircuitBreaker, IntervalPacer, Ledger, RunMetaStore};

pub const CRATE_NAME: &str = "vcsr-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub flows_path: PathBuf,
    pub recency_window_days: i64,
    pub rate_per_second: f64,
    pub retry_cap: usize,
    pub sink_retry_delay: Duration,
    pub breaker_threshold: u32,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            state_dir: std::env::var("VCSR_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            reports_dir: std::env::var("VCSR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            flows_path: std::env::var("VCSR_FLOWS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./flows.yaml")),
            recency_window_days: env_parse("VCSR_RECENCY_WINDOW_DAYS", 1),
            // 50% of the sink's documented 20/s quota, leaving room for jitter.
            rate_per_second: env_parse("VCSR_RATE_PER_SECOND", 10.0),
            retry_cap: env_parse("VCSR_RETRY_CAP", 3),
            sink_retry_delay: Duration::from_secs(env_parse("VCSR_SINK_RETRY_DELAY_SECS", 2)),
            breaker_threshold: env_parse("VCSR_BREAKER_THRESHOLD", 5),
            http_timeout: Duration::from_secs(env_parse("VCSR_HTTP_TIMEOUT_SECS", 30)),
            user_agent: std::env::var("VCSR_USER_AGENT")
                .unwrap_or_else(|_| "vcsr-bot/0.1".to_string()),
            scheduler_enabled: std::env::var("VCSR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }

    pub fn source_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.retry_cap,
            ..BackoffPolicy::default()
        }
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            max_retries: self.retry_cap,
            retry_delay: self.sink_retry_delay,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowRegistry {
    pub flows: Vec<FlowConfig>,
}

/// One named flow: a source spec, a sink spec, and its own ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    pub flow_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub source: SourceSpec,
    pub sink: SinkSpec,
}

pub fn load_flow_registry(path: &PathBuf) -> Result<FlowRegistry> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Delivery engine
// ---------------------------------------------------------------------------

/// Retry posture for one sink send: 404-style "not accepting yet" responses
/// get `max_retries` total attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    pub max_retries: usize,
    pub retry_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Composes the pacer, the breaker and the retry policy around one sink.
/// Never touches the ledger; commits happen in the orchestrator, strictly
/// after a `Sent` outcome is observed.
pub struct DeliveryEngine {
    sink: Arc<dyn SinkAdapter>,
    pacer: IntervalPacer,
    breaker: CircuitBreaker,
    policy: DeliveryPolicy,
}

impl DeliveryEngine {
    pub fn new(
        sink: Arc<dyn SinkAdapter>,
        rate_per_second: f64,
        breaker_threshold: u32,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            sink,
            pacer: IntervalPacer::from_rate(rate_per_second),
            breaker: CircuitBreaker::new(breaker_threshold),
            policy,
        }
    }

    pub fn breaker_is_open(&self) -> bool {
        self.breaker.is_open()
    }

    pub async fn deliver(&mut self, record: &Record) -> DeliveryOutcome {
        if self.breaker.is_open() {
            return DeliveryOutcome::Failed;
        }

        self.pacer.acquire().await;

        let attempts = self.policy.max_retries.max(1);
        for attempt in 0..attempts {
            match self.sink.send(record).await {
                Ok(SinkStatus::Accepted) => {
                    self.breaker.record_success();
                    return DeliveryOutcome::Sent;
                }
                // Expected-quota condition, not a fault: the failure counter
                // stays untouched and the pass stops at the orchestrator.
                Ok(SinkStatus::RateLimited) => {
                    warn!(sink_id = self.sink.sink_id(), record_id = %record.id, "sink rate limit hit");
                    return DeliveryOutcome::RateLimited;
                }
                Ok(SinkStatus::NotReady) => {
                    if attempt + 1 < attempts {
                        warn!(
                            sink_id = self.sink.sink_id(),
                            record_id = %record.id,
                            attempt = attempt + 1,
                            attempts,
                            "sink not accepting yet, retrying"
                        );
                        tokio::time::sleep(self.policy.retry_delay).await;
                        continue;
                    }
                    warn!(
                        sink_id = self.sink.sink_id(),
                        record_id = %record.id,
                        attempts,
                        "sink still not accepting after retries"
                    );
                    self.breaker.record_failure();
                    return DeliveryOutcome::Failed;
                }
                Ok(SinkStatus::Rejected(status)) => {
                    warn!(sink_id = self.sink.sink_id(), record_id = %record.id, status, "sink rejected record");
                    self.breaker.record_failure();
                    return DeliveryOutcome::Failed;
                }
                Err(err) => {
                    warn!(sink_id = self.sink.sink_id(), record_id = %record.id, error = %err, "sink transport error");
                    self.breaker.record_failure();
                    return DeliveryOutcome::Failed;
                }
            }
        }
        unreachable!("delivery attempt loop always returns")
    }
}

// ---------------------------------------------------------------------------
// Pass summary
// ---------------------------------------------------------------------------

pub const STATUS_DONE: &str = "done";
pub const STATUS_ABORTED: &str = "aborted";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub flow_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub abort_reason: Option<String>,
    pub counts: PassCounts,
}

impl PassSummary {
    pub fn aborted(&self) -> bool {
        self.status != STATUS_DONE
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct SyncPipeline {
    config: SyncConfig,
    flow_id: String,
    source: Arc<dyn SourceAdapter>,
    sink: Arc<dyn SinkAdapter>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        flow_id: impl Into<String>,
        source: Arc<dyn SourceAdapter>,
        sink: Arc<dyn SinkAdapter>,
    ) -> Self {
        Self {
            config,
            flow_id: flow_id.into(),
            source,
            sink,
        }
    }

    fn ledger_path(&self) -> PathBuf {
        self.config.state_dir.join(&self.flow_id).join("ledger.json")
    }

    fn meta_store(&self) -> RunMetaStore {
        RunMetaStore::new(self.config.state_dir.join(&self.flow_id).join("last_run.json"))
    }

    /// One pass: Fetching -> Filtering -> Delivering -> Committing -> Done,
    /// with Aborted reachable from Fetching (no ledger mutation, no metadata
    /// write) and from Delivering (partial commit of everything already
    /// confirmed sent).
    pub async fn run_once(&self) -> Result<PassSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, flow_id = %self.flow_id, source_id = self.source.source_id(), "pass started");

        // Fetching: drain pages until the cursor runs out.
        let filters = FetchFilters::recency_days(self.config.recency_window_days);
        let mut fetched: Vec<Record> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match self.source.fetch_page(cursor.as_deref(), &filters).await {
                Ok(page) => {
                    fetched.extend(page.records);
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(err) => {
                    // Page-set completeness can't be trusted; abort with the
                    // ledger untouched.
                    warn!(%run_id, flow_id = %self.flow_id, error = %err, "fetch failed, aborting pass");
                    let summary = PassSummary {
                        run_id,
                        flow_id: self.flow_id.clone(),
                        started_at,
                        finished_at: Utc::now(),
                        status: STATUS_ABORTED.to_string(),
                        abort_reason: Some(format!("fetch: {err}")),
                        counts: PassCounts::default(),
                    };
                    self.write_reports(&summary, &[]).await?;
                    return Ok(summary);
                }
            }
        }

        // Adapters filter empty ids at fetch time; this guard catches any
        // adapter that forgets. An empty key collides across records.
        fetched.retain(|record| {
            let keep = !record.id.trim().is_empty();
            if !keep {
                warn!(flow_id = %self.flow_id, "dropping record with empty id");
            }
            keep
        });

        // Filtering: set difference against the ledger.
        let mut ledger = Ledger::load(self.ledger_path())
            .await
            .context("loading ledger")?;
        let candidates: HashSet<String> = fetched.iter().map(|r| r.id.clone()).collect();
        let new_ids = ledger.diff(&candidates);

        let mut counts = PassCounts {
            fetched: fetched.len(),
            new: new_ids.len(),
            sent: 0,
            failed: 0,
        };

        if new_ids.is_empty() {
            info!(%run_id, flow_id = %self.flow_id, fetched = counts.fetched, "no new records, pass is a no-op");
            self.meta_store().mark_now().await.context("writing run metadata")?;
            let summary = PassSummary {
                run_id,
                flow_id: self.flow_id.clone(),
                started_at,
                finished_at: Utc::now(),
                status: STATUS_DONE.to_string(),
                abort_reason: None,
                counts,
            };
            self.write_reports(&summary, &fetched).await?;
            return Ok(summary);
        }

        // Delivering: fetch order, each new id attempted once per pass.
        let mut engine = DeliveryEngine::new(
            self.sink.clone(),
            self.config.rate_per_second,
            self.config.breaker_threshold,
            self.config.delivery_policy(),
        );
        let mut remaining = new_ids;
        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut abort_reason: Option<String> = None;

        for record in &fetched {
            if !remaining.remove(&record.id) {
                continue;
            }
            match engine.deliver(record).await {
                DeliveryOutcome::Sent => {
                    pending.insert(record.id.clone());
                }
                DeliveryOutcome::RateLimited => {
                    // Remaining records carry over to the next pass via the
                    // ledger.
                    abort_reason = Some("sink rate limited".to_string());
                    break;
                }
                DeliveryOutcome::Failed => {
                    counts.failed += 1;
                    if engine.breaker_is_open() {
                        warn!(%run_id, flow_id = %self.flow_id, "circuit breaker open, aborting remaining deliveries");
                        abort_reason = Some("circuit breaker open".to_string());
                        break;
                    }
                }
            }
        }
        counts.sent = pending.len();

        // Committing: progress already made is never lost, even on abort.
        if !pending.is_empty() {
            ledger
                .commit(pending.iter().cloned(), &format!("pass {run_id}"))
                .await
                .context("committing ledger")?;
        }
        self.meta_store().mark_now().await.context("writing run metadata")?;

        let status = if abort_reason.is_none() {
            STATUS_DONE
        } else {
            STATUS_ABORTED
        };
        let summary = PassSummary {
            run_id,
            flow_id: self.flow_id.clone(),
            started_at,
            finished_at: Utc::now(),
            status: status.to_string(),
            abort_reason,
            counts,
        };
        self.write_reports(&summary, &fetched).await?;

        if summary.aborted() {
            warn!(
                %run_id,
                flow_id = %self.flow_id,
                reason = summary.abort_reason.as_deref().unwrap_or(""),
                fetched = counts.fetched,
                new = counts.new,
                sent = counts.sent,
                failed = counts.failed,
                "pass aborted"
            );
        } else {
            info!(
                %run_id,
                flow_id = %self.flow_id,
                fetched = counts.fetched,
                new = counts.new,
                sent = counts.sent,
                failed = counts.failed,
                "pass finished"
            );
        }
        Ok(summary)
    }

    async fn write_reports(&self, summary: &PassSummary, fetched: &[Record]) -> Result<()> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let summary_json =
            serde_json::to_vec_pretty(summary).context("serializing pass summary")?;
        fs::write(run_dir.join("pass_summary.json"), summary_json)
            .await
            .context("writing pass_summary.json")?;

        let records_json = serde_json::to_vec_pretty(fetched).context("serializing records")?;
        fs::write(run_dir.join("records.json"), records_json)
            .await
            .context("writing records.json")?;

        let brief = format!(
            "# Sync Pass\n\n- Run ID: `{}`\n- Flow: {}\n- Started: {}\n- Finished: {}\n- Status: {}{}\n- Fetched: {}\n- New: {}\n- Sent: {}\n- Failed: {}\n",
            summary.run_id,
            summary.flow_id,
            summary.started_at,
            summary.finished_at,
            summary.status,
            summary
                .abort_reason
                .as_deref()
                .map(|reason| format!(" ({reason})"))
                .unwrap_or_default(),
            summary.counts.fetched,
            summary.counts.new,
            summary.counts.sent,
            summary.counts.failed,
        );
        fs::write(run_dir.join("pass_brief.md"), brief)
            .await
            .context("writing pass_brief.md")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Flow-level entry points
// ---------------------------------------------------------------------------

pub async fn run_flow_once(config: &SyncConfig, flow: &FlowConfig) -> Result<PassSummary> {
    let source = source_for_spec(
        &flow.source,
        config.http_timeout,
        Some(&config.user_agent),
        config.source_backoff(),
    )
    .with_context(|| format!("building source for flow {}", flow.flow_id))?;
    let sink = sink_for_spec(&flow.sink, config.http_timeout, Some(&config.user_agent))
        .with_context(|| format!("building sink for flow {}", flow.flow_id))?;

    SyncPipeline::new(config.clone(), flow.flow_id.clone(), source, sink)
        .run_once()
        .await
}

/// Run one pass for every enabled flow (or a single named flow).
pub async fn run_from_env(flow_filter: Option<&str>) -> Result<Vec<PassSummary>> {
    let config = SyncConfig::from_env();
    let registry = load_flow_registry(&config.flows_path)?;

    let mut summaries = Vec::new();
    for flow in &registry.flows {
        if !flow.enabled {
            continue;
        }
        if let Some(filter) = flow_filter {
            if flow.flow_id != filter {
                continue;
            }
        }
        summaries.push(run_flow_once(&config, flow).await?);
    }
    if summaries.is_empty() {
        if let Some(filter) = flow_filter {
            anyhow::bail!("no enabled flow named {filter}");
        }
    }
    Ok(summaries)
}

pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let job = Job::new_async(cron.as_str(), |_uuid, _lock| {
            Box::pin(async move {
                match run_from_env(None).await {
                    Ok(summaries) => {
                        info!(passes = summaries.len(), "scheduled sync finished")
                    }
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

// ---------------------------------------------------------------------------
// Ledger seeding + operator report
// ---------------------------------------------------------------------------

/// Bootstrap a flow's ledger from a CSV export's first column, through the
/// same commit path a pass uses. Returns how many ids the ledger now holds.
pub async fn seed_ledger_from_csv(
    ledger_path: impl Into<PathBuf>,
    csv_path: &PathBuf,
    provenance: &str,
) -> Result<usize> {
    let text = std::fs::read_to_string(csv_path)
        .with_context(|| format!("reading {}", csv_path.display()))?;

    let mut lines = text.lines().peekable();
    if let Some(first) = lines.peek() {
        let first_cell = first.split(',').next().unwrap_or("").trim().to_ascii_lowercase();
        if first_cell.contains("id") {
            lines.next();
        }
    }

    let ids: Vec<String> = lines
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    if ids.is_empty() {
        anyhow::bail!("no ids found in {}", csv_path.display());
    }

    let mut ledger = Ledger::load(ledger_path).await.context("loading ledger")?;
    ledger.commit(ids, provenance).await.context("seeding ledger")?;
    Ok(ledger.len())
}

/// Markdown digest of the most recent passes, newest first.
pub fn report_recent_markdown(runs: usize, reports_root: &PathBuf) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# VCSR Recent Passes".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("pass_summary.json");
        let summary: PassSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- flow: {}", summary.flow_id));
        lines.push(format!(
            "- status: {}{}",
            summary.status,
            summary
                .abort_reason
                .as_deref()
                .map(|reason| format!(" ({reason})"))
                .unwrap_or_default()
        ));
        lines.push(format!(
            "- fetched {} / new {} / sent {} / failed {}",
            summary.counts.fetched, summary.counts.new, summary.counts.sent, summary.counts.failed
        ));
        lines.push(format!("- finished: {}", summary.finished_at));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use vcsr_adapters::SinkError;

    /// Sink that replays a scripted sequence of responses, then accepts.
    struct ScriptedSink {
        script: Mutex<VecDeque<Result<SinkStatus, SinkError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSink {
        fn new(script: Vec<Result<SinkStatus, SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SinkAdapter for ScriptedSink {
        fn sink_id(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _record: &Record) -> Result<SinkStatus, SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or(Ok(SinkStatus::Accepted))
        }
    }

    fn engine(sink: Arc<ScriptedSink>, threshold: u32) -> DeliveryEngine {
        DeliveryEngine::new(sink, 1000.0, threshold, DeliveryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_send_resets_the_breaker() {
        let sink = ScriptedSink::new(vec![
            Ok(SinkStatus::Rejected(500)),
            Ok(SinkStatus::Accepted),
        ]);
        let mut engine = engine(sink.clone(), 5);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Sent);
        assert!(!engine.breaker_is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fast_fails_without_calling_the_sink() {
        let sink = ScriptedSink::new(vec![Ok(SinkStatus::Rejected(500))]);
        let mut engine = engine(sink.clone(), 1);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert!(engine.breaker_is_open());
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_threshold_attempts_against_a_dead_sink() {
        let sink = ScriptedSink::new(
            (0..20).map(|_| Ok(SinkStatus::Rejected(500))).collect(),
        );
        let mut engine = engine(sink.clone(), 5);

        let record = Record::new("conv-1");
        let mut outcomes = 0;
        while !engine.breaker_is_open() {
            assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
            outcomes += 1;
        }
        assert_eq!(outcomes, 5);
        assert_eq!(sink.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_retries_then_counts_one_failure() {
        let sink = ScriptedSink::new(vec![
            Ok(SinkStatus::NotReady),
            Ok(SinkStatus::NotReady),
            Ok(SinkStatus::NotReady),
        ]);
        let mut engine = engine(sink.clone(), 5);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert_eq!(sink.calls(), 3);
        assert!(!engine.breaker_is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_then_accepted_is_sent() {
        let sink = ScriptedSink::new(vec![Ok(SinkStatus::NotReady), Ok(SinkStatus::Accepted)]);
        let mut engine = engine(sink.clone(), 5);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Sent);
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_does_not_touch_the_failure_counter() {
        let sink = ScriptedSink::new(vec![
            Ok(SinkStatus::RateLimited),
            Ok(SinkStatus::Accepted),
        ]);
        let mut engine = engine(sink.clone(), 1);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::RateLimited);
        assert!(!engine.breaker_is_open());
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_count_as_failures() {
        let sink = ScriptedSink::new(vec![
            Err(SinkError::Transport("connection reset".to_string())),
            Err(SinkError::Transport("connection reset".to_string())),
        ]);
        let mut engine = engine(sink.clone(), 2);

        let record = Record::new("conv-1");
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert_eq!(engine.deliver(&record).await, DeliveryOutcome::Failed);
        assert!(engine.breaker_is_open());
    }

    #[test]
    fn flow_registry_parses() {
        let yaml = r#"
flows:
  - flow_id: voice-qa
    display_name: Voice QA relay
    enabled: true
    source:
      kind: api
      endpoint: https://api.example.test/conversations
      api_key_env: UPSTREAM_API_KEY
      flow_type: VOICE
    sink:
      kind: webhook
      url_env: QA_WEBHOOK_URL
  - flow_id: voice-sheet
    display_name: Voice QA sheet
    enabled: false
    source:
      kind: warehouse
      database_url_env: WAREHOUSE_URL
      query_path: queries/voice.sql
      columns: [conversation_id, summary, created_at_utc]
      id_column: conversation_id
      timestamp_column: created_at_utc
    sink:
      kind: sheet
      append_url_env: SHEET_APPEND_URL
      columns: [summary, created_at_utc]
"#;
        let registry: FlowRegistry = serde_yaml::from_str(yaml).expect("registry yaml");
        assert_eq!(registry.flows.len(), 2);
        assert!(registry.flows[0].enabled);
        assert!(!registry.flows[1].enabled);
    }
}
