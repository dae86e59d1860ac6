use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{Benchmark, DohMethod, DohProtocol};

/// DNS load generator and latency benchmark
#[derive(Parser, Debug)]
#[command(name = "dnsblitz")]
#[command(about = "Benchmark DNS servers over UDP, TCP, DoT, DoH and DoQ")]
pub struct Cli {
	/// Benchmarked server: <host>[:port] for plain DNS and DoT,
	/// http[s]://<host>[:port][/path] for DoH, quic://<host>[:port] for DoQ
	pub server: String,

	/// Domains and data sources: literal domains, @<file> references and
	/// http[s]:// URLs serving newline-separated domain lists
	#[arg(required = true)]
	pub queries: Vec<String>,

	/// DNS query type fired for every domain (repeatable)
	#[arg(short = 't', long = "type", default_values = ["A"])]
	pub types: Vec<String>,

	/// How many times each worker iterates the full question list.
	/// Mutually exclusive with --duration
	#[arg(short = 'n', long = "number", default_value = "0")]
	pub number: i64,

	/// Run for the given number of seconds instead of a fixed count
	#[arg(long = "duration", default_value = "0")]
	pub duration: u64,

	/// Number of concurrent workers
	#[arg(short = 'c', long = "concurrency", default_value = "1")]
	pub concurrency: u32,

	/// Global queries-per-second limit shared by all workers (0 = unlimited)
	#[arg(short = 'l', long = "rate-limit", default_value = "0")]
	pub rate_limit: u32,

	/// Per-worker queries-per-second limit (0 = unlimited)
	#[arg(long = "rate-limit-worker", default_value = "0")]
	pub rate_limit_worker: u32,

	/// Queries sent per connection before redialing, for plain DNS and DoT
	/// (0 = reuse the connection indefinitely)
	#[arg(long = "qperconn", default_value = "0")]
	pub qperconn: i64,

	/// Do not set the Recursion Desired flag on queries
	#[arg(long = "norecurse")]
	pub norecurse: bool,

	/// Chance for each domain to be used in an iteration (>= 1 uses all,
	/// <= 0 skips everything)
	#[arg(long = "probability", default_value = "1.0")]
	pub probability: f64,

	/// EDNS0 buffer size advertised in queries (0 disables EDNS0)
	#[arg(long = "edns0", default_value = "0")]
	pub edns0: u16,

	/// EDNS option attached to every query, in code:hex format
	#[arg(long = "ednsopt", default_value = "")]
	pub ednsopt: String,

	/// Set the DNSSEC OK (DO) bit on all queries
	#[arg(long = "dnssec")]
	pub dnssec: bool,

	/// Use TCP instead of UDP for plain DNS
	#[arg(long = "tcp")]
	pub tcp: bool,

	/// Use DNS-over-TLS
	#[arg(long = "dot")]
	pub dot: bool,

	/// Write timeout in milliseconds
	#[arg(long = "write", default_value = "1000")]
	pub write_ms: u64,

	/// Read timeout in milliseconds
	#[arg(long = "read", default_value = "3000")]
	pub read_ms: u64,

	/// Connection establishment timeout in milliseconds
	#[arg(long = "connect", default_value = "1000")]
	pub connect_ms: u64,

	/// Overall timeout for a single request in milliseconds
	#[arg(long = "request", default_value = "5000")]
	pub request_ms: u64,

	/// Do not collect the per-rcode response distribution
	#[arg(long = "no-rcodes")]
	pub no_rcodes: bool,

	/// Lower latency histogram bound in milliseconds
	#[arg(long = "hist-min", default_value = "0")]
	pub hist_min_ms: u64,

	/// Upper latency histogram bound in milliseconds (0 = request timeout)
	#[arg(long = "hist-max", default_value = "0")]
	pub hist_max_ms: u64,

	/// Significant figures kept by the latency histogram (1-5)
	#[arg(long = "hist-pre", default_value = "1")]
	pub hist_pre: u8,

	/// Write the latency distribution to this CSV file
	#[arg(long = "csv")]
	pub csv: Option<PathBuf>,

	/// Print the report as JSON
	#[arg(long = "json")]
	pub json: bool,

	/// Suppress all stdout output
	#[arg(long = "silent")]
	pub silent: bool,

	/// HTTP method for DoH requests
	#[arg(long = "doh-method", value_enum, default_value = "post")]
	pub doh_method: DohMethod,

	/// HTTP protocol version for DoH requests
	#[arg(long = "doh-protocol", value_enum, default_value = "1.1")]
	pub doh_protocol: DohProtocol,

	/// Disable TLS certificate verification for DoT, DoH and DoQ
	#[arg(long = "insecure")]
	pub insecure: bool,
}

impl Cli {
	pub fn into_benchmark(self) -> Benchmark {
		Benchmark {
			server: self.server,
			types: self.types,
			count: self.number,
			duration: Duration::from_secs(self.duration),
			concurrency: self.concurrency.max(1),
			rate: self.rate_limit,
			rate_limit_worker: self.rate_limit_worker,
			qper_conn: self.qperconn,
			recurse: !self.norecurse,
			probability: self.probability,
			edns_opt: self.ednsopt,
			dnssec: self.dnssec,
			edns0: self.edns0,
			tcp: self.tcp,
			dot: self.dot,
			write_timeout: Duration::from_millis(self.write_ms),
			read_timeout: Duration::from_millis(self.read_ms),
			connect_timeout: Duration::from_millis(self.connect_ms),
			request_timeout: Duration::from_millis(self.request_ms),
			rcodes: !self.no_rcodes,
			hist_min: Duration::from_millis(self.hist_min_ms),
			hist_max: Duration::from_millis(self.hist_max_ms),
			hist_pre: self.hist_pre,
			csv: self.csv,
			json: self.json,
			silent: self.silent,
			doh_method: self.doh_method,
			doh_protocol: self.doh_protocol,
			insecure: self.insecure,
			queries: self.queries,
			..Default::default()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let cli = Cli::parse_from(["dnsblitz", "8.8.8.8", "example.com"]);
		let b = cli.into_benchmark();
		assert_eq!(b.server, "8.8.8.8");
		assert_eq!(b.queries, vec!["example.com"]);
		assert_eq!(b.types, vec!["A"]);
		assert_eq!(b.concurrency, 1);
		assert!(b.recurse);
		assert!(b.rcodes);
		assert_eq!(b.request_timeout, Duration::from_secs(5));
	}

	#[test]
	fn test_doh_protocol_names() {
		let cli = Cli::parse_from([
			"dnsblitz",
			"--doh-protocol",
			"3",
			"--doh-method",
			"get",
			"https://1.1.1.1",
			"example.com",
		]);
		assert_eq!(cli.doh_protocol, DohProtocol::Http3);
		assert_eq!(cli.doh_method, DohMethod::Get);
	}

	#[test]
	fn test_repeatable_types_and_flags() {
		let cli = Cli::parse_from([
			"dnsblitz",
			"-t",
			"A",
			"-t",
			"AAAA",
			"--norecurse",
			"--no-rcodes",
			"--dnssec",
			"1.1.1.1",
			"example.com",
			"example.org",
		]);
		let b = cli.into_benchmark();
		assert_eq!(b.types, vec!["A", "AAAA"]);
		assert!(!b.recurse);
		assert!(!b.rcodes);
		assert!(b.dnssec);
		assert_eq!(b.queries.len(), 2);
	}
}
