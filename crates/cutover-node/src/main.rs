use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;

use cutover_exec::StubExecutor;
use cutover_router::{
    new_correlation_id, AdminCommand, MigrationRouter, PhaseController, ShadowConfig,
};
use cutover_telemetry::{TelemetryConfig, TelemetryEmitter, TracingSink};
use cutover_types::{ExecError, Payload, RoutingConfig};

#[derive(clap::Parser, Debug)]
#[command(name = "cutover-node", about = "Progressive migration router with a simulated workload")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Admin changes applied after config load: "key=value", repeatable
    #[arg(long = "admin")]
    admin: Vec<String>,
    #[arg(long, default_value_t = 1000)]
    requests: usize,
    #[arg(long, default_value_t = 32)]
    concurrency: usize,
    #[arg(long, default_value_t = 5)]
    legacy_latency_ms: u64,
    #[arg(long, default_value_t = 5)]
    new_latency_ms: u64,
    /// Fraction of New calls that fail
    #[arg(long, default_value_t = 0.0)]
    new_error_rate: f64,
    /// Fraction of New responses that differ from Legacy
    #[arg(long, default_value_t = 0.0)]
    new_divergence_rate: f64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    routing: RoutingConfig,
    shadow: ShadowConfig,
    telemetry: TelemetryConfig,
    observability: ObservabilityConfig,
}

const ENDPOINTS: [&str; 3] = ["tickets.get", "tickets.list", "tickets.update"];

fn legacy_stub(latency: Duration) -> StubExecutor {
    StubExecutor::echo().with_latency(latency)
}

fn new_stub(latency: Duration, error_rate: f64, divergence_rate: f64) -> StubExecutor {
    StubExecutor::from_fn(move |req| {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(error_rate) {
            return Err(ExecError::Internal("simulated new implementation failure".into()));
        }
        let mut out = json!({ "endpoint": req.endpoint_id, "body": req.body });
        if rng.gen_bool(divergence_rate) {
            out["body"] = json!({ "rewritten": true });
        }
        Ok(out)
    })
    .with_latency(latency)
}

type StubRouter = MigrationRouter<StubExecutor, StubExecutor>;

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(config_path) = path {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    figment
        .merge(Env::prefixed("CUTOVER_").split("__"))
        .extract()
        .context("failed to load configuration")
}

/// Drives `requests` calls through the router with at most `concurrency` in
/// flight. Returns how many callers saw an error.
async fn replay(
    router: Arc<StubRouter>,
    requests: usize,
    concurrency: usize,
) -> anyhow::Result<u64> {
    let mut tasks: JoinSet<Result<Payload, ExecError>> = JoinSet::new();
    let mut errors = 0u64;
    for i in 0..requests {
        if tasks.len() >= concurrency.max(1) {
            if let Some(joined) = tasks.join_next().await {
                if joined.context("request task panicked")?.is_err() {
                    errors += 1;
                }
            }
        }
        let router = router.clone();
        tasks.spawn(async move {
            let endpoint = ENDPOINTS[i % ENDPOINTS.len()];
            router
                .handle(&new_correlation_id(), endpoint, json!({ "id": i }))
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        if joined.context("request task panicked")?.is_err() {
            errors += 1;
        }
    }
    Ok(errors)
}

fn check_rate(name: &str, value: f64) -> anyhow::Result<()> {
    anyhow::ensure!((0.0..=1.0).contains(&value), "{name} must be within [0, 1], got {value}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .init();
        }
    }

    check_rate("--new-error-rate", cli.new_error_rate)?;
    check_rate("--new-divergence-rate", cli.new_divergence_rate)?;

    let controller = Arc::new(
        PhaseController::new(config.routing.clone()).context("invalid [routing] configuration")?,
    );
    for raw in &cli.admin {
        let command: AdminCommand = raw
            .parse()
            .with_context(|| format!("invalid --admin value: {raw}"))?;
        controller
            .apply(&command)
            .with_context(|| format!("admin command rejected: {command}"))?;
    }

    let routing = controller.get_config();
    tracing::info!(
        phase = %routing.phase,
        migration_percentage = routing.migration_percentage,
        validation_sampling = routing.validation_sampling,
        fallback_enabled = routing.fallback_enabled,
        fallback_timeout_ms = routing.fallback_timeout.as_millis() as u64,
        requests = cli.requests,
        concurrency = cli.concurrency,
        "router starting"
    );

    let (emitter, drain) = TelemetryEmitter::spawn(Arc::new(TracingSink), &config.telemetry)
        .context("invalid [telemetry] configuration")?;
    let router = MigrationRouter::new(
        controller,
        Arc::new(legacy_stub(Duration::from_millis(cli.legacy_latency_ms))),
        Arc::new(new_stub(
            Duration::from_millis(cli.new_latency_ms),
            cli.new_error_rate,
            cli.new_divergence_rate,
        )),
        &config.shadow,
        emitter,
    )
    .context("invalid [shadow] configuration")?;
    let router = Arc::new(router);

    let errors = replay(router.clone(), cli.requests, cli.concurrency).await?;

    // Shadow runs are detached; give them up to their own timeout to finish.
    let shadow_deadline =
        tokio::time::Instant::now() + Duration::from_millis(config.shadow.timeout_ms);
    while router.shadow_stats().in_flight > 0 && tokio::time::Instant::now() < shadow_deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut summary = json!({
        "routing": &*router.controller().get_config(),
        "router": router.stats(),
        "shadow": router.shadow_stats(),
        "caller_errors": errors,
    });

    // Dropping the router releases the last emitter handle; the drain then
    // flushes and reports its final counters.
    drop(router);
    let telemetry = drain.await.context("telemetry drain task failed")?;
    summary["telemetry"] = serde_json::to_value(telemetry)?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
