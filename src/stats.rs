use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use hdrhistogram::Histogram;
use hickory_proto::op::{Message, ResponseCode};
use serde::Serialize;

use crate::config::Benchmark;
use crate::transport::{DohStatusError, Exchange};

/// Outcome counters of a single worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
	/// Every attempted query.
	pub total: u64,
	/// Attempts where the transport or message parsing failed.
	pub io_error: u64,
	/// Responses with rcode NOERROR.
	pub success: u64,
	/// Responses with rcode NXDOMAIN.
	pub negative: u64,
	/// Responses with any other rcode.
	pub error: u64,
	/// Responses whose transaction id did not match the request.
	pub id_mismatch: u64,
	/// Responses with the TC flag set.
	pub truncated: u64,
}

/// Latency of one successful exchange, anchored at its send time.
#[derive(Debug, Clone, Copy)]
pub struct Datapoint {
	pub start: SystemTime,
	pub latency: Duration,
}

/// One failed exchange, anchored at its send time.
#[derive(Debug, Clone)]
pub struct ErrorDatapoint {
	pub start: SystemTime,
	pub error: String,
}

/// Mutable per-worker record of benchmark results.
///
/// Owned exclusively by one worker during the run; the reducer merges the
/// per-worker records after all workers have joined. Optional maps are
/// only allocated for the features enabled on the benchmark, a disabled
/// category stays `None` and is never written.
#[derive(Debug)]
pub struct ResultStats {
	pub counters: Counters,
	pub hist: Histogram<u64>,
	pub codes: Option<HashMap<u16, u64>>,
	pub qtypes: HashMap<String, u64>,
	pub doh_status_codes: Option<HashMap<u16, u64>>,
	pub timings: Vec<Datapoint>,
	pub errors: Vec<ErrorDatapoint>,
	pub authenticated_domains: Option<HashSet<String>>,
	dnssec: bool,
}

/// Latency histogram over the configured bounds, in nanoseconds.
///
/// Also used by the reducer so per-worker histograms and the merged one
/// share identical bounds.
pub fn new_histogram(b: &Benchmark) -> Result<Histogram<u64>> {
	// hdrhistogram needs a positive lower bound and at least a 2x range.
	let low = (b.hist_min.as_nanos() as u64).max(1);
	let high = (b.hist_max.as_nanos() as u64).max(low * 2);
	Ok(Histogram::new_with_bounds(low, high, b.hist_pre)?)
}

impl ResultStats {
	pub fn new(b: &Benchmark) -> Result<Self> {
		let hist = new_histogram(b)?;
		Ok(ResultStats {
			counters: Counters::default(),
			hist,
			codes: b.rcodes.then(HashMap::new),
			qtypes: HashMap::new(),
			doh_status_codes: b.use_doh.then(HashMap::new),
			timings: Vec::new(),
			errors: Vec::new(),
			authenticated_domains: b.dnssec.then(HashSet::new),
			dnssec: b.dnssec,
		})
	}

	/// Record one attempt.
	///
	/// An errored attempt only counts towards `total` and `io_error`; rcode
	/// classification, qtype tallies and the histogram are reserved for
	/// attempts that produced a response.
	pub fn record(
		&mut self,
		request: &Message,
		outcome: &Result<Exchange>,
		start: SystemTime,
		latency: Duration,
	) {
		self.counters.total += 1;

		let exchange = match outcome {
			Err(err) => {
				self.counters.io_error += 1;
				self.errors.push(ErrorDatapoint {
					start,
					error: format!("{:#}", err),
				});
				if let Some(status_err) = err.downcast_ref::<DohStatusError>() {
					self.tally_doh_status(status_err.status);
				}
				return;
			}
			Ok(exchange) => exchange,
		};
		let response = &exchange.response;

		match response.response_code() {
			ResponseCode::NoError => self.counters.success += 1,
			ResponseCode::NXDomain => self.counters.negative += 1,
			_ => self.counters.error += 1,
		}

		if let Some(question) = request.queries().first() {
			*self
				.qtypes
				.entry(question.query_type().to_string())
				.or_insert(0) += 1;

			if self.dnssec && response.authentic_data() {
				if let Some(domains) = self.authenticated_domains.as_mut() {
					domains.insert(question.name().to_string());
				}
			}
		}

		if let Some(codes) = self.codes.as_mut() {
			*codes.entry(u16::from(response.response_code())).or_insert(0) += 1;
		}

		if response.truncated() {
			self.counters.truncated += 1;
		}
		if response.id() != request.id() {
			self.counters.id_mismatch += 1;
		}

		self.hist.saturating_record(latency.as_nanos() as u64);
		self.timings.push(Datapoint { start, latency });

		if let Some(status) = exchange.doh_status {
			self.tally_doh_status(status);
		}
	}

	fn tally_doh_status(&mut self, status: u16) {
		if let Some(statuses) = self.doh_status_codes.as_mut() {
			*statuses.entry(status).or_insert(0) += 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::anyhow;
	use hickory_proto::op::{MessageType, Query};
	use hickory_proto::rr::{Name, RecordType};

	fn config() -> Benchmark {
		let mut b = Benchmark {
			server: "127.0.0.1".to_string(),
			dnssec: true,
			..Default::default()
		};
		b.prepare().unwrap();
		b
	}

	fn request(id: u16, qtype: RecordType) -> Message {
		let mut msg = Message::new();
		msg.set_id(id);
		msg.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), qtype));
		msg
	}

	fn response_for(request: &Message, rcode: ResponseCode) -> Message {
		let mut msg = request.clone();
		msg.set_message_type(MessageType::Response);
		msg.set_response_code(rcode);
		msg
	}

	fn ok(response: Message) -> Result<Exchange> {
		Ok(Exchange {
			response,
			doh_status: None,
		})
	}

	fn record_now(stats: &mut ResultStats, request: &Message, outcome: &Result<Exchange>) {
		stats.record(request, outcome, SystemTime::now(), Duration::from_millis(3));
	}

	#[test]
	fn test_counter_sum_invariant() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);

		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::NoError)));
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::NXDomain)));
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::ServFail)));
		record_now(&mut stats, &req, &Err(anyhow!("write udp 127.0.0.1:53: broken pipe")));

		let c = stats.counters;
		assert_eq!(c.total, 4);
		assert_eq!(c.success, 1);
		assert_eq!(c.negative, 1);
		assert_eq!(c.error, 1);
		assert_eq!(c.io_error, 1);
		assert_eq!(c.total, c.success + c.negative + c.error + c.io_error);
	}

	#[test]
	fn test_io_error_skips_rcode_accounting() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);

		record_now(&mut stats, &req, &Err(anyhow!("read udp: timeout")));

		assert_eq!(stats.counters.io_error, 1);
		assert_eq!(stats.counters.success, 0);
		assert!(stats.qtypes.is_empty());
		assert_eq!(stats.hist.len(), 0);
		assert!(stats.timings.is_empty());
		assert_eq!(stats.errors.len(), 1);
		assert!(stats.errors[0].error.contains("timeout"));
	}

	#[test]
	fn test_qtype_tally_matches_classified_responses() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();

		let a = request(1, RecordType::A);
		let aaaa = request(2, RecordType::AAAA);
		record_now(&mut stats, &a, &ok(response_for(&a, ResponseCode::NoError)));
		record_now(&mut stats, &a, &ok(response_for(&a, ResponseCode::NXDomain)));
		record_now(&mut stats, &aaaa, &ok(response_for(&aaaa, ResponseCode::NoError)));

		assert_eq!(stats.qtypes.get("A"), Some(&2));
		assert_eq!(stats.qtypes.get("AAAA"), Some(&1));
		let tallied: u64 = stats.qtypes.values().sum();
		let c = stats.counters;
		assert_eq!(tallied, c.success + c.negative + c.error);
	}

	#[test]
	fn test_truncated_and_id_mismatch_are_independent() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(42, RecordType::A);

		let mut resp = response_for(&req, ResponseCode::NoError);
		resp.set_truncated(true);
		resp.set_id(43);
		record_now(&mut stats, &req, &ok(resp));

		let c = stats.counters;
		assert_eq!(c.truncated, 1);
		assert_eq!(c.id_mismatch, 1);
		// The response is still classified by rcode.
		assert_eq!(c.success, 1);
	}

	#[test]
	fn test_rcode_distribution_collected() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);

		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::NoError)));
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::ServFail)));
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::ServFail)));

		let codes = stats.codes.as_ref().unwrap();
		assert_eq!(codes.get(&0), Some(&1));
		assert_eq!(codes.get(&2), Some(&2));
	}

	#[test]
	fn test_rcodes_disabled_leaves_map_unallocated() {
		let mut b = config();
		b.rcodes = false;
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::NoError)));
		assert!(stats.codes.is_none());
	}

	#[test]
	fn test_authenticated_domains_collected() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);

		let mut resp = response_for(&req, ResponseCode::NoError);
		resp.set_authentic_data(true);
		record_now(&mut stats, &req, &ok(resp));
		// A second response without AD must not add anything new.
		record_now(&mut stats, &req, &ok(response_for(&req, ResponseCode::NoError)));

		let domains = stats.authenticated_domains.as_ref().unwrap();
		assert_eq!(domains.len(), 1);
		assert!(domains.contains("example.com."));
	}

	#[test]
	fn test_doh_status_tallied_on_success_and_error() {
		let mut b = Benchmark {
			server: "https://127.0.0.1/dns-query".to_string(),
			..Default::default()
		};
		b.prepare().unwrap();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);

		let outcome = Ok(Exchange {
			response: response_for(&req, ResponseCode::NoError),
			doh_status: Some(200),
		});
		record_now(&mut stats, &req, &outcome);

		let err: Result<Exchange> = Err(anyhow::Error::new(DohStatusError { status: 503 }));
		record_now(&mut stats, &req, &err);

		let statuses = stats.doh_status_codes.as_ref().unwrap();
		assert_eq!(statuses.get(&200), Some(&1));
		assert_eq!(statuses.get(&503), Some(&1));
		assert_eq!(stats.counters.io_error, 1);
	}

	#[test]
	fn test_latency_observed_in_histogram() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);
		stats.record(
			&req,
			&ok(response_for(&req, ResponseCode::NoError)),
			SystemTime::now(),
			Duration::from_millis(25),
		);
		assert_eq!(stats.hist.len(), 1);
		assert_eq!(stats.timings.len(), 1);
		assert_eq!(stats.timings[0].latency, Duration::from_millis(25));
	}

	#[test]
	fn test_latency_beyond_bounds_is_clamped() {
		let b = config();
		let mut stats = ResultStats::new(&b).unwrap();
		let req = request(1, RecordType::A);
		// Way past hist_max (request_timeout), must clamp instead of drop.
		stats.record(
			&req,
			&ok(response_for(&req, ResponseCode::NoError)),
			SystemTime::now(),
			Duration::from_secs(600),
		);
		assert_eq!(stats.hist.len(), 1);
	}
}
