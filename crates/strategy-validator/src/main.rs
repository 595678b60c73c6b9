//! strategy-validator: run a reference strategy through the full validation
//! pipeline (backtest, walk-forward, Monte Carlo, overfitting) and print the
//! graded report as JSON.
//!
//! Usage:
//!   cargo run -p strategy-validator -- --bars data/spy_daily.json
//!   cargo run -p strategy-validator -- --bars data/spy_daily.json --strategy buy_and_hold
//!   cargo run -p strategy-validator -- --bars data/spy_daily.json --config validation.json \
//!       --param fast=8 --param slow=34 --output report.json
//!   cargo run -p strategy-validator -- --bars data/spy_daily.json --summary --timeout 60
//!
//! The bars file is a JSON array of `{timestamp, open, high, low, close, volume}`.

mod strategies;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use backtest_engine::{Bar, CancellationToken, ParameterSet};
use strategies::StrategyKind;
use validation::{Orchestrator, ProgressEvent, ValidationConfig};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "strategy_validator=info,backtest_engine=info,validation=info".into()
        })
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    // Logs go to stderr so stdout stays a clean JSON document.
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .init();
    }

    let args: Vec<String> = std::env::args().collect();
    let flag_value = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    };

    let Some(bars_path) = flag_value("--bars") else {
        bail!("usage: strategy-validator --bars <file.json> [--strategy sma_crossover|buy_and_hold] [--config <file.json>] [--param name=value]... [--output <file.json>] [--timeout <secs>] [--summary]");
    };
    let kind = match flag_value("--strategy") {
        Some(name) => StrategyKind::from_str(name).map_err(anyhow::Error::msg)?,
        None => StrategyKind::SmaCrossover,
    };
    let summary_only = args.iter().any(|a| a == "--summary");

    let bars = load_bars(Path::new(bars_path))?;
    tracing::info!(bars = bars.len(), path = bars_path, "Loaded price history");

    let mut config = match flag_value("--config") {
        Some(path) => load_config(Path::new(path))?,
        None => default_config(kind),
    };
    for (name, value) in parse_params(&args)? {
        config.base_params.insert(name, value);
    }
    apply_env_overrides(&mut config)?;

    let cancel = match flag_value("--timeout") {
        Some(secs) => {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid --timeout value '{secs}'"))?;
            CancellationToken::with_timeout(Duration::from_secs(secs))
        }
        None => CancellationToken::new(),
    };

    let mut orchestrator = Orchestrator::new(config)
        .context("invalid validation config")?
        .with_cancellation(cancel);
    orchestrator.add_listener(|event: &ProgressEvent| match event {
        ProgressEvent::StageStarted { stage } => tracing::debug!(%stage, "Stage started"),
        ProgressEvent::StageCompleted { stage } => tracing::debug!(%stage, "Stage completed"),
        ProgressEvent::StageSkipped { stage, reason } => {
            tracing::debug!(%stage, reason = reason.as_str(), "Stage skipped")
        }
        ProgressEvent::Finished { overall_score } => {
            tracing::debug!(overall_score, "Validation finished")
        }
    });

    tracing::info!(strategy = %kind, "Validating strategy");
    let factory = move |params: &ParameterSet| kind.build(params);
    let report = orchestrator
        .run(&bars, &factory)
        .context("validation run failed")?;

    tracing::info!("{}", report.summary());
    for warning in &report.assessment.warnings {
        tracing::warn!("{warning}");
    }

    if summary_only {
        println!("{}", report.summary());
        return Ok(());
    }

    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    match flag_value("--output") {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("failed to write {path}"))?;
            tracing::info!(path, "Report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bars from {}", path.display()))?;
    let mut bars: Vec<Bar> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse bars in {}", path.display()))?;
    if bars.is_empty() {
        bail!("{} contains no bars", path.display());
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

fn load_config(path: &Path) -> Result<ValidationConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse config in {}", path.display()))
}

/// Defaults tuned to the chosen strategy: its own parameters as the base set
/// and its search space for walk-forward optimization.
fn default_config(kind: StrategyKind) -> ValidationConfig {
    let mut config = ValidationConfig {
        base_params: kind.default_params(),
        ..Default::default()
    };
    if let Some(wf) = config.walk_forward.as_mut() {
        wf.parameter_ranges = kind.default_ranges();
    }
    config
}

/// Collect every `--param name=value` pair.
fn parse_params(args: &[String]) -> Result<Vec<(String, f64)>> {
    args.windows(2)
        .filter(|w| w[0] == "--param")
        .map(|w| -> Result<(String, f64)> {
            let (name, value) = w[1]
                .split_once('=')
                .with_context(|| format!("--param expects name=value, got '{}'", w[1]))?;
            let value: f64 = value
                .parse()
                .with_context(|| format!("invalid value for parameter '{name}'"))?;
            Ok((name.to_string(), value))
        })
        .collect()
}

fn env_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name} value '{raw}'")),
        Err(_) => Ok(None),
    }
}

fn apply_env_overrides(config: &mut ValidationConfig) -> Result<()> {
    if let Some(seed) = env_var::<u64>("VALIDATION_SEED")? {
        config.backtest.seed = seed;
        if let Some(mc) = config.monte_carlo.as_mut() {
            mc.seed = seed;
        }
    }
    if let Some(simulations) = env_var::<usize>("MONTE_CARLO_SIMULATIONS")? {
        if let Some(mc) = config.monte_carlo.as_mut() {
            mc.num_simulations = simulations;
        }
    }
    if let Some(wf) = config.walk_forward.as_mut() {
        if let Some(train) = env_var::<usize>("WALK_FORWARD_TRAIN_BARS")? {
            wf.training_size = train;
        }
        if let Some(test) = env_var::<usize>("WALK_FORWARD_TEST_BARS")? {
            wf.test_size = test;
        }
        let window = wf.training_size + wf.test_size;
        if wf.min_data_points < window {
            tracing::warn!(
                configured = wf.min_data_points,
                raised_to = window,
                "min_data_points is below one train+test window, raising it"
            );
            wf.min_data_points = window;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_params() {
        let parsed = parse_params(&args(&[
            "strategy-validator",
            "--param",
            "fast=8",
            "--bars",
            "x.json",
            "--param",
            "slow=34.5",
        ]))
        .unwrap();
        assert_eq!(
            parsed,
            vec![("fast".to_string(), 8.0), ("slow".to_string(), 34.5)]
        );
    }

    #[test]
    fn test_parse_params_rejects_malformed() {
        assert!(parse_params(&args(&["--param", "fast"])).is_err());
        assert!(parse_params(&args(&["--param", "fast=abc"])).is_err());
    }

    #[test]
    fn test_default_config_uses_strategy_search_space() {
        let config = default_config(StrategyKind::SmaCrossover);
        assert_eq!(config.base_params["fast"], 10.0);
        let wf = config.walk_forward.unwrap();
        assert_eq!(wf.parameter_ranges.len(), 2);

        default_config(StrategyKind::BuyAndHold).validate().unwrap();
    }

    #[test]
    fn test_env_window_override_raises_min_data_points() {
        std::env::set_var("WALK_FORWARD_TRAIN_BARS", "300");
        std::env::set_var("WALK_FORWARD_TEST_BARS", "100");
        let mut config = default_config(StrategyKind::SmaCrossover);
        let outcome = apply_env_overrides(&mut config);
        std::env::remove_var("WALK_FORWARD_TRAIN_BARS");
        std::env::remove_var("WALK_FORWARD_TEST_BARS");
        outcome.unwrap();

        let wf = config.walk_forward.unwrap();
        assert_eq!(wf.training_size, 300);
        assert_eq!(wf.test_size, 100);
        assert_eq!(wf.min_data_points, 400);
    }
}
