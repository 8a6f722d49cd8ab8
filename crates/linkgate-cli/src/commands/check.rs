//! `linkgate check`: run the gate once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args;
use linkgate_core::{GateDecision, LinkgateConfig, PrincipalId, StoreConfig};
use linkgate_daemon::{
    ConsistencyGate, GateReport, LoggingRecoveryTrigger, MetricsRegistry, SqliteLinkageStore,
    StoreRef,
};
use tracing::info;

/// Exit code for `Allow`.
pub const EXIT_ALLOW: u8 = 0;
/// Exit code for `BlockRecover`.
pub const EXIT_BLOCK_RECOVER: u8 = 2;
/// Exit code for `BlockUnavailable`.
pub const EXIT_BLOCK_UNAVAILABLE: u8 = 3;

/// Arguments for `linkgate check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Principal id returned by the identity provider
    #[arg(long)]
    principal: String,

    /// The identity record is not yet verified
    #[arg(long)]
    unverified: bool,

    /// Correlation id to adopt (generated when absent or invalid)
    #[arg(long)]
    correlation_id: Option<String>,

    /// Output format (`text` or `json`)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    /// Print Prometheus metrics to stderr after the check
    #[arg(long)]
    metrics: bool,
}

/// Runs the gate and prints the report. Returns the process exit code.
pub fn run(config_path: &Path, args: &CheckArgs) -> Result<u8> {
    let config = LinkgateConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;
    let principal = PrincipalId::new(args.principal.as_str()).context("invalid --principal")?;

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let stores = config
        .stores
        .iter()
        .map(|store| open_store(store, base_dir))
        .collect::<Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let registry = MetricsRegistry::new().context("failed to register metrics")?;
        let gate = ConsistencyGate::builder(config.gate.clone())
            .stores(stores)
            .metrics(registry.gate_metrics().clone())
            .recovery_trigger(Arc::new(LoggingRecoveryTrigger), config.recovery)
            .build()
            .context("failed to build gate")?;

        let report = gate
            .check(&principal, !args.unverified, args.correlation_id.as_deref())
            .await;
        info!(
            correlation_id = %report.correlation_id,
            decision = report.decision.as_str(),
            "gate check complete"
        );

        match args.format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&report)?),
            _ => print_text(&report),
        }
        gate.shutdown().await;
        if args.metrics {
            eprint!("{}", registry.encode_text()?);
        }
        Ok::<_, anyhow::Error>(exit_code(&report.decision))
    })
}

fn open_store(store: &StoreConfig, base_dir: &Path) -> Result<StoreRef> {
    let Some(sqlite) = &store.sqlite else {
        bail!("store '{}' has no [stores.sqlite] backing", store.name);
    };
    let path = resolve(base_dir, &sqlite.path);
    let adapter =
        SqliteLinkageStore::open(store.name.as_str(), &path, &sqlite.table, &sqlite.column)
            .with_context(|| {
                format!("failed to open store '{}' at {}", store.name, path.display())
            })?;
    Ok(StoreRef::new(Arc::new(adapter), store.required))
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

const fn exit_code(decision: &GateDecision) -> u8 {
    match decision {
        GateDecision::Allow => EXIT_ALLOW,
        GateDecision::BlockRecover { .. } => EXIT_BLOCK_RECOVER,
        GateDecision::BlockUnavailable { .. } => EXIT_BLOCK_UNAVAILABLE,
    }
}

fn print_text(report: &GateReport) {
    println!("decision:       {}", report.decision.as_str());
    println!("outcome:        {}", report.outcome.as_str());
    println!("correlation_id: {}", report.correlation_id);
    println!("attempts:       {}", report.attempts.len());
    println!(
        "elapsed:        {}",
        humantime::format_duration(truncate_to_millis(report.elapsed))
    );
    if report.degraded {
        println!("degraded:       true");
    }
    if let Some(message) = report.decision.user_message() {
        println!("message:        {message}");
    }
}

fn truncate_to_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use linkgate_core::CorrelationId;

    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_decision() {
        let cid = CorrelationId::generate();
        assert_eq!(exit_code(&GateDecision::Allow), EXIT_ALLOW);
        assert_eq!(
            exit_code(&GateDecision::BlockUnavailable {
                correlation_id: cid
            }),
            EXIT_BLOCK_UNAVAILABLE
        );
    }

    #[test]
    fn relative_store_paths_resolve_against_config_dir() {
        let base = Path::new("/etc/linkgate");
        assert_eq!(
            resolve(base, Path::new("app.db")),
            PathBuf::from("/etc/linkgate/app.db")
        );
        assert_eq!(
            resolve(base, Path::new("/var/lib/app.db")),
            PathBuf::from("/var/lib/app.db")
        );
    }
}
