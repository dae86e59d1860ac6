use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use hdrhistogram::Histogram;
use hickory_proto::op::ResponseCode;
use serde::Serialize;

use crate::config::Benchmark;
use crate::stats::{self, Counters, Datapoint, ErrorDatapoint, ResultStats};

/// Merged view over all per-worker result records.
///
/// Counters are summed, histograms merged, tally maps unioned by per-key
/// summation, timing and error sequences concatenated and stable-sorted
/// by their start timestamps.
pub struct Summary {
	pub counters: Counters,
	pub hist: Histogram<u64>,
	pub codes: BTreeMap<u16, u64>,
	pub qtypes: BTreeMap<String, u64>,
	pub doh_statuses: BTreeMap<u16, u64>,
	pub timings: Vec<Datapoint>,
	pub errors: Vec<ErrorDatapoint>,
	pub top_errors: Vec<(String, u64)>,
	pub authenticated_domains: BTreeSet<String>,
}

/// Reduce the per-worker records into one `Summary`.
pub fn merge(b: &Benchmark, results: &[ResultStats]) -> Result<Summary> {
	let mut counters = Counters::default();
	let mut hist = stats::new_histogram(b)?;
	let mut codes = BTreeMap::new();
	let mut qtypes = BTreeMap::new();
	let mut doh_statuses = BTreeMap::new();
	let mut timings = Vec::new();
	let mut errors = Vec::new();
	let mut error_counts: HashMap<&str, u64> = HashMap::new();
	let mut authenticated_domains = BTreeSet::new();

	for s in results {
		counters.total += s.counters.total;
		counters.io_error += s.counters.io_error;
		counters.success += s.counters.success;
		counters.negative += s.counters.negative;
		counters.error += s.counters.error;
		counters.id_mismatch += s.counters.id_mismatch;
		counters.truncated += s.counters.truncated;

		hist.add(&s.hist)
			.map_err(|e| anyhow!("failed to merge latency histograms: {}", e))?;

		if let Some(worker_codes) = &s.codes {
			for (code, count) in worker_codes {
				*codes.entry(*code).or_insert(0) += count;
			}
		}
		for (qtype, count) in &s.qtypes {
			*qtypes.entry(qtype.clone()).or_insert(0) += count;
		}
		if let Some(statuses) = &s.doh_status_codes {
			for (status, count) in statuses {
				*doh_statuses.entry(*status).or_insert(0) += count;
			}
		}
		timings.extend_from_slice(&s.timings);
		errors.extend_from_slice(&s.errors);
		for e in &s.errors {
			*error_counts.entry(e.error.as_str()).or_insert(0) += 1;
		}
		if let Some(domains) = &s.authenticated_domains {
			authenticated_domains.extend(domains.iter().cloned());
		}
	}

	timings.sort_by_key(|d| d.start);
	errors.sort_by_key(|e| e.start);

	let mut top_errors: Vec<(String, u64)> = error_counts
		.into_iter()
		.map(|(e, c)| (e.to_string(), c))
		.collect();
	top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
	top_errors.truncate(3);

	Ok(Summary {
		counters,
		hist,
		codes,
		qtypes,
		doh_statuses,
		timings,
		errors,
		top_errors,
		authenticated_domains,
	})
}

/// Print the benchmark report, export the CSV distribution when requested.
pub fn print_report(b: &Benchmark, results: &[ResultStats], elapsed: Duration) -> Result<()> {
	let summary = merge(b, results)?;

	if let Some(path) = &b.csv {
		write_distribution_csv(path, &summary.hist)
			.with_context(|| format!("failed to write CSV export to '{}'", path.display()))?;
	}

	if b.silent {
		return Ok(());
	}
	if b.json {
		println!("{}", serde_json::to_string_pretty(&JsonReport::new(b, &summary, elapsed))?);
		return Ok(());
	}
	print_text(b, &summary, elapsed);
	Ok(())
}

fn print_text(b: &Benchmark, summary: &Summary, elapsed: Duration) {
	let c = summary.counters;
	println!();
	println!("Total requests:       {}", c.total);
	if c.io_error > 0 {
		println!("Read/Write errors:    {}", c.io_error);
	}
	if c.id_mismatch > 0 {
		println!("ID mismatch errors:   {}", c.id_mismatch);
	}
	if c.truncated > 0 {
		println!("Truncated responses:  {}", c.truncated);
	}
	println!("Time taken for tests: {:.2?}", elapsed);
	let qps = c.total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
	println!("Questions per second: {:.1}", qps);

	if !summary.codes.is_empty() {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_content_arrangement(ContentArrangement::Dynamic);
		table.set_header(vec!["Response code", "Count"]);
		for (code, count) in &summary.codes {
			table.add_row(vec![rcode_name(*code), count.to_string()]);
		}
		println!("\nDNS response codes:\n{table}");
	}

	if !summary.qtypes.is_empty() {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_content_arrangement(ContentArrangement::Dynamic);
		table.set_header(vec!["Question type", "Count"]);
		for (qtype, count) in &summary.qtypes {
			table.add_row(vec![qtype.clone(), count.to_string()]);
		}
		println!("\nDNS question types:\n{table}");
	}

	if !summary.doh_statuses.is_empty() {
		let mut table = Table::new();
		table.load_preset(UTF8_FULL);
		table.set_content_arrangement(ContentArrangement::Dynamic);
		table.set_header(vec!["DoH status", "Count"]);
		for (status, count) in &summary.doh_statuses {
			table.add_row(vec![status.to_string(), count.to_string()]);
		}
		println!("\nDoH response statuses:\n{table}");
	}

	if b.dnssec {
		println!("\nNumber of domains secured with DNSSEC: {}", summary.authenticated_domains.len());
		for domain in &summary.authenticated_domains {
			println!("\t{}", domain);
		}
	}

	let hist = &summary.hist;
	if hist.len() > 0 {
		println!("\nDNS timings ({} datapoints):", hist.len());
		println!("\tmin:  {:.2?}", Duration::from_nanos(hist.min()));
		println!("\tmean: {:.2?}", Duration::from_nanos(hist.mean() as u64));
		println!("\tp50:  {:.2?}", Duration::from_nanos(hist.value_at_quantile(0.50)));
		println!("\tp90:  {:.2?}", Duration::from_nanos(hist.value_at_quantile(0.90)));
		println!("\tp95:  {:.2?}", Duration::from_nanos(hist.value_at_quantile(0.95)));
		println!("\tp99:  {:.2?}", Duration::from_nanos(hist.value_at_quantile(0.99)));
		println!("\tmax:  {:.2?}", Duration::from_nanos(hist.max()));
	}

	if !summary.top_errors.is_empty() {
		println!("\nTotal errors: {}", summary.errors.len());
		println!("Top errors:");
		for (error, count) in &summary.top_errors {
			println!("\t{} ({})", error, count);
		}
	}
}

fn rcode_name(code: u16) -> String {
	let rcode: ResponseCode = code.into();
	rcode.to_string()
}

/// CSV export of the merged latency distribution, one bucket per row.
fn write_distribution_csv(path: &std::path::Path, hist: &Histogram<u64>) -> Result<()> {
	let mut writer = csv::Writer::from_path(path)?;
	writer.write_record(["From (ns)", "To (ns)", "Count"])?;
	for value in hist.iter_recorded() {
		let to = value.value_iterated_to();
		writer.write_record([
			hist.lowest_equivalent(to).to_string(),
			to.to_string(),
			value.count_at_value().to_string(),
		])?;
	}
	writer.flush()?;
	Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport {
	total_requests: u64,
	total_success_responses: u64,
	total_negative_responses: u64,
	total_error_responses: u64,
	total_io_errors: u64,
	total_id_mismatch: u64,
	total_truncated_responses: u64,
	response_rcodes: BTreeMap<String, u64>,
	question_types: BTreeMap<String, u64>,
	doh_statuses: BTreeMap<u16, u64>,
	queries_per_second: f64,
	benchmark_duration_seconds: f64,
	latency_stats: JsonLatencyStats,
	#[serde(skip_serializing_if = "BTreeSet::is_empty")]
	authenticated_domains: BTreeSet<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	top_errors: Vec<JsonTopError>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonLatencyStats {
	min_ms: u64,
	mean_ms: u64,
	std_ms: u64,
	max_ms: u64,
	p99_ms: u64,
	p95_ms: u64,
	p90_ms: u64,
	p75_ms: u64,
	p50_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonTopError {
	error: String,
	count: u64,
}

impl JsonReport {
	fn new(b: &Benchmark, summary: &Summary, elapsed: Duration) -> Self {
		let c = summary.counters;
		let hist = &summary.hist;
		let ms = |ns: u64| Duration::from_nanos(ns).as_millis() as u64;
		JsonReport {
			total_requests: c.total,
			total_success_responses: c.success,
			total_negative_responses: c.negative,
			total_error_responses: c.error,
			total_io_errors: c.io_error,
			total_id_mismatch: c.id_mismatch,
			total_truncated_responses: c.truncated,
			response_rcodes: summary
				.codes
				.iter()
				.map(|(code, count)| (rcode_name(*code), *count))
				.collect(),
			question_types: summary.qtypes.clone(),
			doh_statuses: summary.doh_statuses.clone(),
			queries_per_second: c.total as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
			benchmark_duration_seconds: elapsed.as_secs_f64(),
			latency_stats: JsonLatencyStats {
				min_ms: ms(if hist.len() > 0 { hist.min() } else { 0 }),
				mean_ms: ms(hist.mean() as u64),
				std_ms: ms(hist.stdev() as u64),
				max_ms: ms(hist.max()),
				p99_ms: ms(hist.value_at_quantile(0.99)),
				p95_ms: ms(hist.value_at_quantile(0.95)),
				p90_ms: ms(hist.value_at_quantile(0.90)),
				p75_ms: ms(hist.value_at_quantile(0.75)),
				p50_ms: ms(hist.value_at_quantile(0.50)),
			},
			authenticated_domains: summary.authenticated_domains.clone(),
			top_errors: summary
				.top_errors
				.iter()
				.map(|(error, count)| JsonTopError {
					error: error.clone(),
					count: *count,
				})
				.collect(),
		}
	}
}
