use std::str::FromStr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use hickory_proto::rr::{Name, RecordType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Benchmark;
use crate::query;
use crate::questions;
use crate::ratelimit::RateLimiter;
use crate::stats::ResultStats;
use crate::transport::{self, QueryClient};

impl Benchmark {
	/// Execute the benchmark.
	///
	/// Validates the configuration, resolves the question list, spawns
	/// `concurrency` workers and joins them, returning one result record
	/// per worker. Setup failures abort before any worker starts;
	/// per-request failures are recorded and never abort the run.
	pub async fn run(&mut self, token: CancellationToken) -> Result<Vec<ResultStats>> {
		self.prepare()?;

		let questions = questions::resolve(&self.queries).await?;
		if questions.is_empty() {
			bail!("no domains to benchmark, provide at least one query");
		}
		let names: Vec<Name> = questions
			.iter()
			.map(|q| Name::from_ascii(q).map_err(|e| anyhow!("invalid domain name '{}': {}", q, e)))
			.collect::<Result<_>>()?;
		let qtypes: Vec<RecordType> = self
			.types
			.iter()
			.map(|t| {
				RecordType::from_str(&t.to_uppercase())
					.map_err(|e| anyhow!("unsupported query type '{}': {}", t, e))
			})
			.collect::<Result<_>>()?;
		if qtypes.is_empty() {
			bail!("no query types to benchmark, provide at least one type");
		}

		if !self.silent && !self.json {
			println!("Using {} hostnames", names.len());
		}

		// Workers observe cancellation through a child token so an external
		// cancel and the duration deadline look the same from the inside.
		let token = token.child_token();
		if !self.duration.is_zero() {
			let deadline = self.duration;
			let deadline_token = token.clone();
			tokio::spawn(async move {
				tokio::select! {
					_ = tokio::time::sleep(deadline) => {
						debug!("benchmark duration reached, cancelling workers");
						deadline_token.cancel();
					}
					_ = deadline_token.cancelled() => {}
				}
			});
		}

		let shared = transport::build_shared(self)?;
		let global_limit = (self.rate > 0).then(|| Arc::new(RateLimiter::new(self.rate)));

		if !self.silent && !self.json {
			println!(
				"Benchmarking {} via {} with {} concurrent requests{}",
				self.server,
				transport::network_label(self),
				self.concurrency,
				self.limits_note()
			);
		}

		let cfg = Arc::new(self.clone());
		let names = Arc::new(names);
		let qtypes = Arc::new(qtypes);

		let mut handles = Vec::with_capacity(self.concurrency as usize);
		for _ in 0..self.concurrency {
			let stats = ResultStats::new(self)?;
			let client = QueryClient::for_worker(self, &shared);
			handles.push(tokio::spawn(worker(
				cfg.clone(),
				names.clone(),
				qtypes.clone(),
				client,
				global_limit.clone(),
				token.clone(),
				stats,
			)));
		}

		let mut stats = Vec::with_capacity(handles.len());
		for handle in handles {
			stats.push(handle.await.context("benchmark worker panicked")?);
		}
		Ok(stats)
	}

	fn limits_note(&self) -> String {
		match (self.rate, self.rate_limit_worker) {
			(0, 0) => String::new(),
			(rate, 0) => format!(" (limited to {} QPS overall)", rate),
			(0, per_worker) => format!(" (limited to {} QPS per concurrent worker)", per_worker),
			(rate, per_worker) => format!(
				" (limited to {} QPS overall and {} QPS per concurrent worker)",
				rate, per_worker
			),
		}
	}
}

/// The per-worker query loop.
///
/// Iterates `(repetition, question, qtype)` in order, skipping iterations
/// by the sampling probability, pacing through the global then the
/// per-worker limiter, and recording every attempt it issues. Exits at the
/// next checkpoint once the cancellation token fires; an attempt aborted
/// mid-flight by shutdown is not recorded.
async fn worker(
	cfg: Arc<Benchmark>,
	names: Arc<Vec<Name>>,
	qtypes: Arc<Vec<RecordType>>,
	mut client: QueryClient,
	global_limit: Option<Arc<RateLimiter>>,
	token: CancellationToken,
	mut stats: ResultStats,
) -> ResultStats {
	let mut rng = StdRng::from_entropy();
	let worker_limit = (cfg.rate_limit_worker > 0).then(|| RateLimiter::new(cfg.rate_limit_worker));
	let network = transport::network_label(&cfg);

	let mut i: i64 = 0;
	'run: while i < cfg.count || !cfg.duration.is_zero() {
		for name in names.iter() {
			for &qtype in qtypes.iter() {
				if token.is_cancelled() {
					break 'run;
				}
				if !sampled(cfg.probability, &mut rng) {
					continue;
				}
				if let Some(limit) = &global_limit {
					if !limit.take_until(&token).await {
						break 'run;
					}
				}
				if let Some(limit) = &worker_limit {
					if !limit.take_until(&token).await {
						break 'run;
					}
				}

				let msg = query::build_query(&cfg, name, qtype, &mut rng);

				let wall_start = SystemTime::now();
				let start = Instant::now();
				let outcome = tokio::select! {
					result = tokio::time::timeout(cfg.request_timeout, client.exchange(&msg)) => {
						match result {
							Ok(outcome) => outcome,
							Err(_) => Err(anyhow!("request {} {}: i/o timeout", network, cfg.server)),
						}
					}
					_ = token.cancelled() => break 'run,
				};
				stats.record(&msg, &outcome, wall_start, start.elapsed());
			}
		}
		i += 1;
	}

	stats
}

/// Domain-sampling decision: a probability of 1 or more keeps every
/// iteration, 0 or less skips them all.
fn sampled<R: Rng>(probability: f64, rng: &mut R) -> bool {
	probability >= 1.0 || rng.gen::<f64>() < probability
}
