use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::ValueEnum;
use url::Url;

/// Default EDNS0 buffer size when an OPT record must be created implicitly,
/// per http://www.dnsflagday.net/2020/
pub const DEFAULT_EDNS0_BUFFER_SIZE: u16 = 1232;

/// HTTP method used for DoH requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DohMethod {
	Get,
	Post,
}

/// HTTP protocol version used for DoH requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DohProtocol {
	#[value(name = "1.1")]
	Http1,
	#[value(name = "2")]
	Http2,
	#[value(name = "3")]
	Http3,
}

/// A runnable DNS benchmark scenario.
///
/// Based on the domains in `queries`, each of the `concurrency` workers fires
/// DNS queries until it has sent `count` repetitions of the full
/// (question x type) cross-product, or until `duration` has elapsed.
/// The struct is immutable after `prepare` and shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct Benchmark {
	/// Benchmarked server. Plain DNS and DoT use `<host>[:port]` (default
	/// ports 53 and 853), DoH uses `http[s]://<host>[:port][/path]`
	/// (default path /dns-query), DoQ uses `quic://<host>[:port]`
	/// (default port 853).
	pub server: String,

	/// DNS query types fired for every domain, e.g. ["A", "AAAA"].
	pub types: Vec<String>,

	/// How many times each worker iterates the full question list.
	/// Mutually exclusive with `duration`.
	pub count: i64,

	/// Wall-clock bound for the whole run. Mutually exclusive with `count`.
	pub duration: Duration,

	/// Number of parallel workers.
	pub concurrency: u32,

	/// Global queries-per-second limit shared by all workers. 0 = unlimited.
	pub rate: u32,
	/// Per-worker queries-per-second limit. 0 = unlimited.
	pub rate_limit_worker: u32,

	/// Queries sent per connection before it is closed and redialed.
	/// Only applies to plain DNS (UDP/TCP) and DoT. 0 = reuse indefinitely.
	pub qper_conn: i64,

	/// Whether queries carry the Recursion Desired flag.
	pub recurse: bool,

	/// Chance for each domain to be used in an iteration. >= 1 uses all
	/// domains, <= 0 skips everything.
	pub probability: f64,

	/// EDNS option in `code:hex` format attached to every query.
	pub edns_opt: String,

	/// Sets the DO bit on all queries.
	pub dnssec: bool,

	/// EDNS0 buffer size advertised in queries. 0 disables EDNS0.
	pub edns0: u16,

	/// Use TCP instead of UDP for plain DNS.
	pub tcp: bool,
	/// Use DNS-over-TLS.
	pub dot: bool,

	pub write_timeout: Duration,
	pub read_timeout: Duration,
	pub connect_timeout: Duration,
	/// Overall timeout for a single exchange.
	pub request_timeout: Duration,

	/// Collect the per-rcode response distribution.
	pub rcodes: bool,

	/// Lower bound of the latency histogram.
	pub hist_min: Duration,
	/// Upper bound of the latency histogram. 0 defaults to `request_timeout`.
	pub hist_max: Duration,
	/// Significant figures kept by the histogram, 1-5.
	pub hist_pre: u8,

	/// Optional path for the CSV export of the latency distribution.
	pub csv: Option<PathBuf>,
	/// Print the report as JSON instead of text.
	pub json: bool,

	/// Suppress all stdout output during the run.
	pub silent: bool,

	pub doh_method: DohMethod,
	pub doh_protocol: DohProtocol,

	/// Disable TLS certificate verification for DoT, DoH and DoQ.
	pub insecure: bool,

	/// Domains and data sources: literal domains, `@<file>` references and
	/// `http[s]://` URLs serving newline-separated domain lists.
	pub queries: Vec<String>,

	// Derived by prepare so the hot path does not re-parse the address.
	pub(crate) use_doh: bool,
	pub(crate) use_quic: bool,
	pub(crate) edns_opt_parsed: Option<(u16, Vec<u8>)>,
}

impl Default for Benchmark {
	fn default() -> Self {
		Benchmark {
			server: String::new(),
			types: vec!["A".to_string()],
			count: 0,
			duration: Duration::ZERO,
			concurrency: 1,
			rate: 0,
			rate_limit_worker: 0,
			qper_conn: 0,
			recurse: true,
			probability: 1.0,
			edns_opt: String::new(),
			dnssec: false,
			edns0: 0,
			tcp: false,
			dot: false,
			write_timeout: Duration::from_secs(1),
			read_timeout: Duration::from_secs(3),
			connect_timeout: Duration::from_secs(1),
			request_timeout: Duration::from_secs(5),
			rcodes: true,
			hist_min: Duration::ZERO,
			hist_max: Duration::ZERO,
			hist_pre: 1,
			csv: None,
			json: false,
			silent: false,
			doh_method: DohMethod::Post,
			doh_protocol: DohProtocol::Http1,
			insecure: false,
			queries: Vec::new(),
			use_doh: false,
			use_quic: false,
			edns_opt_parsed: None,
		}
	}
}

impl Benchmark {
	/// Validate and normalize the benchmark settings.
	///
	/// Detects the transport from the server string, injects default ports
	/// and the default DoH path, and rejects inconsistent option combinations.
	pub fn prepare(&mut self) -> Result<()> {
		if self.server.is_empty() {
			bail!("server for benchmarking must not be empty");
		}

		self.use_doh = is_http_url(&self.server);
		self.use_quic = self.server.starts_with("quic://");
		if self.use_quic {
			self.server = self.server.trim_start_matches("quic://").to_string();
		}

		if self.use_doh {
			let parsed = Url::parse(&self.server)
				.map_err(|e| anyhow!("invalid DoH server URL '{}': {}", self.server, e))?;
			if parsed.path().is_empty() || parsed.path() == "/" {
				let mut normalized = parsed;
				normalized.set_path("/dns-query");
				self.server = normalized.to_string();
			}
		}

		self.add_port_if_missing();

		if self.count == 0 && self.duration.is_zero() {
			self.count = 1;
		}

		if !self.duration.is_zero() && self.count > 0 {
			bail!("--number and --duration is specified at once, only one can be used");
		}

		if self.hist_max.is_zero() {
			self.hist_max = self.request_timeout;
		}
		if self.hist_max < self.hist_min {
			bail!("histogram maximum must not be below histogram minimum");
		}
		if self.hist_pre < 1 || self.hist_pre > 5 {
			bail!("histogram precision must be between 1 and 5 significant figures");
		}

		if self.edns0 != 0 && !(512..=4096).contains(&self.edns0) {
			bail!("--edns0 must have value between 512 and 4096");
		}

		if !self.edns_opt.is_empty() {
			let split: Vec<&str> = self.edns_opt.split(':').collect();
			if split.len() != 2 {
				bail!("--ednsopt is not in correct format");
			}
			let data = hex::decode(split[1]).map_err(|_| {
				anyhow!("--ednsopt is not in correct format, data is not hexadecimal string")
			})?;
			let code: u16 = split[0].parse().map_err(|_| {
				anyhow!("--ednsopt is not in correct format, code is not a decimal number")
			})?;
			self.edns_opt_parsed = Some((code, data));
		}

		Ok(())
	}

	/// Append the transport's default port when the server has none.
	///
	/// DoH is left alone, the HTTP stack fills in 80/443 itself.
	fn add_port_if_missing(&mut self) {
		if self.use_doh {
			return;
		}
		if has_port(&self.server) {
			return;
		}
		// RFC 7858 (DoT) and RFC 9250 (DoQ) both register port 853.
		let port = if self.dot || self.use_quic { 853 } else { 53 };
		self.server = join_host_port(&self.server, port);
	}

	/// Host part of the prepared `host:port` server string, brackets stripped.
	pub fn server_host(&self) -> &str {
		split_host_port(&self.server).0
	}
}

pub fn is_http_url(s: &str) -> bool {
	s.starts_with("http://") || s.starts_with("https://")
}

/// Whether the address already carries an explicit port.
///
/// Handles bracketed IPv6 (`[::1]:853`), bare IPv6 (`::1`, no port) and
/// `host[:port]` forms.
fn has_port(s: &str) -> bool {
	if let Some(rest) = s.strip_prefix('[') {
		return rest.contains("]:");
	}
	s.matches(':').count() == 1
}

fn join_host_port(host: &str, port: u16) -> String {
	if host.contains(':') {
		format!("[{}]:{}", host, port)
	} else {
		format!("{}:{}", host, port)
	}
}

/// Split a `host:port` string, stripping IPv6 brackets from the host part.
pub fn split_host_port(s: &str) -> (&str, &str) {
	if let Some(rest) = s.strip_prefix('[') {
		if let Some((host, port)) = rest.split_once("]:") {
			return (host, port);
		}
	}
	match s.rsplit_once(':') {
		Some((host, port)) => (host, port),
		None => (s, ""),
	}
}
