mod bench;
mod cli;
mod config;
mod query;
mod questions;
mod ratelimit;
mod report;
mod stats;
#[cfg(test)]
mod testutil;
mod transport;

use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_writer(std::io::stderr)
		.init();

	let cli = cli::Cli::parse();
	let mut benchmark = cli.into_benchmark();

	// Ctrl-C stops the run gracefully; the report covers what completed.
	let token = CancellationToken::new();
	let signal_token = token.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			signal_token.cancel();
		}
	});

	let start = Instant::now();
	let stats = benchmark.run(token).await?;
	report::print_report(&benchmark, &stats, start.elapsed())?;

	Ok(())
}
