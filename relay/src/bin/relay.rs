use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use relay::{cfg::Config, launcher::RelayLauncher};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Secret key of the relay wallet. Takes precedence over `relay_private_key` in the configuration.
    #[arg(value_parser = PrivateKeySigner::from_str)]
    secret_key: Option<PrivateKeySigner>,
    #[clap(long, short, default_values = ["config.toml"])]
    config_file: Vec<PathBuf>,
    #[clap(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_line_number(true)
        .with_ansi(false);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    log_panics();
    let config = load_config(&args.config_file)?;

    let signer = match (args.secret_key, &config.relay_private_key) {
        (Some(signer), _) => signer,
        (None, Some(key)) => PrivateKeySigner::from_str(key)?,
        (None, None) => {
            return Err(anyhow!(
                "no relay key: pass one on the command line or set relay_private_key"
            ));
        }
    };

    if let Some(endpoint) = &config.otlp_collector_endpoint {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint.clone())
            .build()?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(10))
            .build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        opentelemetry::global::set_meter_provider(provider);
    };

    RelayLauncher::new(signer, config).await?.run().await
}

/// Report panics through `tracing`, so they end up wherever the logs go.
fn log_panics() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string panic payload");
        let thread = std::thread::current();
        let backtrace = Backtrace::capture();
        let backtrace =
            (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());
        let location = info.location();
        tracing::error!(
            thread = thread.name().unwrap_or("<unnamed>"),
            file = location.map(|l| l.file()),
            line = location.map(|l| l.line()),
            backtrace,
            "panicked: {message}"
        );
    }));
}

/// Read every configuration file into one table. Each top-level key may only be set by one file.
fn load_config(files: &[PathBuf]) -> Result<Config> {
    let mut merged = toml::Table::new();
    for file in files {
        let contents =
            fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        let table: toml::Table =
            toml::from_str(&contents).with_context(|| format!("parsing {}", file.display()))?;
        if let Some(key) = table.keys().find(|key| merged.contains_key(*key)) {
            return Err(anyhow!(
                "{} sets {key:?}, which an earlier configuration file already set",
                file.display()
            ));
        }
        merged.extend(table);
    }

    let config = Config::deserialize(merged)?;
    config.validate()?;
    Ok(config)
}
