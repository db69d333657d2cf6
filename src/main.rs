use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use pgafka::{
    consumer::kafka::KafkaConsumer,
    ingester::{Ingester, IngesterError},
    settings::Settings,
    shutdown,
    sink::postgres::PostgresWriter,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit code when the configuration can't be loaded or applied
const CONFIG_ERROR: u8 = 2;

#[doc(hidden)]
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file; PGAFKA__<SECTION>__<KEY> environment variables take precedence
    #[arg(short, long)]
    config: Option<String>,
}

fn init(args: &Args) -> anyhow::Result<Ingester<KafkaConsumer, PostgresWriter>> {
    let settings = Settings::new(args.config.as_deref()).context("cannot load config")?;
    Ingester::from_settings(&settings).context("cannot create ingester")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ingester = match init(&args) {
        Ok(ingester) => ingester,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(CONFIG_ERROR);
        }
    };

    let handle = ingester.start();
    shutdown::listen(handle.shutdown_token());
    match handle.await_termination().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(IngesterError::Aborted(e)) => {
            error!("{e}");
            ExitCode::FAILURE
        }
        // already logged by the ingester on entering FAILED
        Err(_) => ExitCode::FAILURE,
    }
}
