//! Drives the executor with a burst of concurrent moderation actions against a
//! simulated, flaky remote service, then prints health, per-kind metrics and
//! the Prometheus exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use modguard_core::{ActorId, OperationKind, RemoteError, SubjectId};
use modguard_executor::{
    CaseDraft, CaseRecorder, ExecutorConfig, ModerationAction, ModerationExecutor, Notice, Notifier,
    PolicyRegistry, RetryConfig, TimeoutConfig,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const ACTION_LABELS: [&str; 8] = [
    "ban", "kick", "softban", "timeout", "warn", "note", "purge", "role-update",
];

#[derive(Parser, Debug)]
#[command(name = "moderation-sim")]
#[command(about = "Exercise the modguard executor against a simulated remote service", long_about = None)]
struct Cli {
    /// Number of actions to issue concurrently.
    #[arg(long, env = "MODGUARD_SIM_ACTIONS", default_value_t = 200)]
    actions: usize,

    /// Distinct subjects the actions are spread over. Fewer subjects means more contention.
    #[arg(long, env = "MODGUARD_SIM_SUBJECTS", default_value_t = 20)]
    subjects: u64,

    /// Probability that a remote call fails with a server error.
    #[arg(long, env = "MODGUARD_SIM_FAILURE_RATE", default_value_t = 0.15)]
    failure_rate: f64,

    /// Probability that a remote call is rate limited.
    #[arg(long, env = "MODGUARD_SIM_RATE_LIMIT_RATE", default_value_t = 0.05)]
    rate_limit_rate: f64,

    /// Upper bound of simulated remote latency.
    #[arg(long, env = "MODGUARD_SIM_MAX_LATENCY_MS", default_value_t = 80)]
    max_latency_ms: u64,

    /// Base retry delay applied to every kind.
    #[arg(long, env = "MODGUARD_SIM_BASE_DELAY_MS", default_value_t = 50)]
    base_delay_ms: u64,

    /// Emit logs as JSON.
    #[arg(long, env = "MODGUARD_SIM_JSON_LOGS")]
    json_logs: bool,

    /// Print the Prometheus exposition after the run.
    #[arg(long)]
    prometheus: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "moderation_sim=info,modguard_executor=info,modguard::audit=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Short backoffs and timeouts so a run finishes in seconds.
fn simulation_policies(base_delay: Duration) -> anyhow::Result<PolicyRegistry> {
    let mut policies = PolicyRegistry::new();
    for kind in OperationKind::ALL {
        let retry = RetryConfig {
            base_delay,
            max_delay: base_delay * 10,
            rate_limit_cap: Duration::from_secs(1),
            ..RetryConfig::for_kind(kind)
        };
        let timeout = TimeoutConfig {
            operation_timeout: Duration::from_secs(2),
            ..TimeoutConfig::for_kind(kind)
        };
        policies = policies.with_retry(kind, retry)?.with_timeout(kind, timeout)?;
    }
    Ok(policies)
}

// ---------------------------------------------------------------------------
// Simulated collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RemoteProfile {
    failure_rate: f64,
    rate_limit_rate: f64,
    max_latency_ms: u64,
}

async fn simulated_remote(
    profile: RemoteProfile,
    kind: OperationKind,
    subject: SubjectId,
) -> Result<serde_json::Value, RemoteError> {
    let (latency_ms, roll) = {
        let mut rng = rand::rng();
        (rng.random_range(1..=profile.max_latency_ms.max(1)), rng.random::<f64>())
    };
    tokio::time::sleep(Duration::from_millis(latency_ms)).await;

    if roll < profile.rate_limit_rate {
        Err(RemoteError::rate_limited(Some(Duration::from_millis(200)), "slow down"))
    } else if roll < profile.rate_limit_rate + profile.failure_rate {
        Err(RemoteError::server(503, "upstream unavailable"))
    } else {
        Ok(serde_json::json!({ "kind": kind, "subject": subject, "latency_ms": latency_ms }))
    }
}

struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: SubjectId, notice: &Notice) -> anyhow::Result<()> {
        debug!(%subject, title = %notice.title, "notice delivered");
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCaseLog {
    next_case: AtomicU64,
    cases: Mutex<Vec<(u64, CaseDraft)>>,
}

#[async_trait]
impl CaseRecorder for MemoryCaseLog {
    async fn record_case(&self, draft: CaseDraft) -> anyhow::Result<u64> {
        let case_id = self.next_case.fetch_add(1, Ordering::Relaxed) + 1;
        self.cases.lock().push((case_id, draft));
        Ok(case_id)
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus recorder")?;

    let run_id = Uuid::new_v4();
    info!(%run_id, actions = cli.actions, subjects = cli.subjects, "moderation simulation starting");

    let case_log = Arc::new(MemoryCaseLog::default());
    let executor = Arc::new(
        ModerationExecutor::builder()
            .config(ExecutorConfig::default())
            .policies(simulation_policies(Duration::from_millis(cli.base_delay_ms))?)
            .notifier(Arc::new(LogNotifier))
            .case_recorder(Arc::clone(&case_log) as Arc<dyn CaseRecorder>)
            .build(),
    );
    let mut maintenance = executor.start_maintenance();

    let profile = RemoteProfile {
        failure_rate: cli.failure_rate,
        rate_limit_rate: cli.rate_limit_rate,
        max_latency_ms: cli.max_latency_ms,
    };

    let mut tasks = JoinSet::new();
    for n in 0..cli.actions {
        let (label, subject) = {
            let mut rng = rand::rng();
            (
                ACTION_LABELS[rng.random_range(0..ACTION_LABELS.len())],
                SubjectId(rng.random_range(1..=cli.subjects.max(1))),
            )
        };
        let kind = executor.resolve_kind(label)?;
        let actor = ActorId(u64::try_from(n % 5).unwrap_or_default() + 1);

        let mut action = ModerationAction::new(kind, subject, actor, move || simulated_remote(profile, kind, subject))
            .with_reason(format!("simulated {label} #{n}"));
        if kind.is_destructive() {
            action = action
                .with_notice(Notice::new(format!("You received a {kind}"), "See the server rules."))
                .with_case_record();
        }

        let executor = Arc::clone(&executor);
        tasks.spawn(async move { executor.execute(action).await });
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let tag = match joined.context("simulation task panicked")? {
            Ok(_) => "success",
            Err(err) => {
                debug!(error = %err, "action failed");
                err.tag()
            }
        };
        *outcomes.entry(tag).or_insert(0) += 1;
    }
    maintenance.stop().await;

    let health = executor.monitor().get_system_health();
    if health.status != modguard_executor::HealthStatus::Healthy {
        warn!(status = ?health.status, success_rate = health.success_rate, "simulation ended unhealthy");
    }

    println!("run {run_id}");
    println!("outcomes: {}", serde_json::to_string(&outcomes)?);
    println!("cases recorded: {}", case_log.cases.lock().len());
    println!("health: {}", serde_json::to_string_pretty(&health)?);
    println!(
        "metrics: {}",
        serde_json::to_string_pretty(&executor.monitor().get_all_metrics())?
    );
    for (kind, stats) in executor.retry().breaker_stats() {
        println!(
            "breaker {kind}: state={} requests={} rejected={} trips={}",
            stats.state.as_str(),
            stats.total_requests,
            stats.rejected,
            stats.trips
        );
    }
    if cli.prometheus {
        println!("{}", prometheus.render());
    }

    Ok(())
}
