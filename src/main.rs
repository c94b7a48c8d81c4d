use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tc_txn::{Builder, FileLog};
use tc_txn_error::*;
use tc_txn_store::{FixedDelay, Table};

use tc_coordinator::CustomerManager;

fn seconds(flag: &str) -> TCResult<Duration> {
    u64::from_str(flag)
        .map(Duration::from_secs)
        .map_err(|_| TCError::bad_request("Invalid duration in seconds", flag))
}

fn millis(flag: &str) -> TCResult<Duration> {
    u64::from_str(flag)
        .map(Duration::from_millis)
        .map_err(|_| TCError::bad_request("Invalid duration in milliseconds", flag))
}

/// Create customers, each in its own transaction, and report how many were committed.
#[derive(Clone, Parser)]
struct Config {
    #[arg(long = "log_level", default_value = "warn")]
    pub log_level: String,

    /// The timeout of each transaction, in seconds
    #[arg(long = "timeout", value_parser = seconds)]
    pub timeout: Option<Duration>,

    /// How long the customer table delays its prepare vote, in milliseconds
    #[arg(long = "prepare_delay", default_value = "0", value_parser = millis)]
    pub prepare_delay: Duration,

    /// How often to check for timed-out transactions, in milliseconds
    #[arg(long = "sweep_interval", default_value = "100", value_parser = millis)]
    pub sweep_interval: Duration,

    /// Append transaction status records to this file
    #[arg(long = "txn_log")]
    pub txn_log: Option<PathBuf>,

    /// The names of the customers to create
    pub names: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let mut builder = Builder::new().sweep_interval(config.sweep_interval);

    if let Some(path) = &config.txn_log {
        builder = builder.with_log(Arc::new(FileLog::open(path).await?));
    }

    let coordinator = builder.build();

    let delay = Arc::new(FixedDelay::new(config.prepare_delay));
    let customers = Arc::new(Table::with_prepare_delay("customers", delay));
    let manager = CustomerManager::new(coordinator.clone(), customers);

    let context = coordinator.context();
    if let Some(timeout) = config.timeout {
        coordinator
            .set_transaction_timeout(&context, timeout)
            .await?;
    }

    for name in &config.names {
        match manager.create(&context, name).await {
            Ok(true) => println!("created customer {}", name),
            Ok(false) => println!("customer {} already exists", name),
            Err(cause) => println!("failed to create customer {}: {}", name, cause),
        }
    }

    println!("count: {}", manager.count());
    println!("{}", serde_json::to_string_pretty(&manager.list())?);

    Ok(())
}
