//! Transport selection and dispatch.
//!
//! Plain DNS and DoT clients are worker-owned because each worker manages
//! its own persistent connection; DoH and DoQ clients are built once and
//! shared since their libraries multiplex concurrent exchanges safely.

pub mod doh;
pub mod doq;
pub mod plain;
pub mod tls;

use std::sync::Arc;

use anyhow::Result;
use hickory_proto::op::Message;

pub use doh::{DohClient, DohStatusError};
pub use doq::DoqClient;
pub use plain::{Network, PlainClient};

use crate::config::{Benchmark, DohMethod, DohProtocol};

/// Result of one completed exchange.
pub struct Exchange {
	pub response: Message,
	/// HTTP status of the DoH exchange that produced the response.
	pub doh_status: Option<u16>,
}

/// Process-wide client state handed to every worker.
pub enum SharedClient {
	/// Plain DNS and DoT dial per worker, nothing is shared.
	PerWorker,
	Doh(Arc<DohClient>),
	Doq(Arc<DoqClient>),
}

/// Build the shared client for the prepared benchmark configuration.
pub fn build_shared(b: &Benchmark) -> Result<SharedClient> {
	if b.use_doh {
		return Ok(SharedClient::Doh(Arc::new(DohClient::new(b)?)));
	}
	if b.use_quic {
		return Ok(SharedClient::Doq(Arc::new(DoqClient::new(b)?)));
	}
	Ok(SharedClient::PerWorker)
}

/// Opaque send handle held by one worker.
pub enum QueryClient {
	Plain(PlainClient),
	Doh(Arc<DohClient>),
	Doq(Arc<DoqClient>),
}

impl QueryClient {
	pub fn for_worker(b: &Benchmark, shared: &SharedClient) -> QueryClient {
		match shared {
			SharedClient::PerWorker => QueryClient::Plain(PlainClient::new(b)),
			SharedClient::Doh(client) => QueryClient::Doh(client.clone()),
			SharedClient::Doq(client) => QueryClient::Doq(client.clone()),
		}
	}

	/// Dispatch one query to the selected transport.
	pub async fn exchange(&mut self, msg: &Message) -> Result<Exchange> {
		match self {
			QueryClient::Plain(client) => {
				let response = client.exchange(msg).await?;
				Ok(Exchange {
					response,
					doh_status: None,
				})
			}
			QueryClient::Doh(client) => {
				let (response, status) = client.exchange(msg).await?;
				Ok(Exchange {
					response,
					doh_status: Some(status),
				})
			}
			QueryClient::Doq(client) => {
				let response = client.exchange(msg).await?;
				Ok(Exchange {
					response,
					doh_status: None,
				})
			}
		}
	}
}

/// Human-readable label of the selected transport, e.g. `udp`, `tcp-tls`,
/// `https/2 (POST)` or `quic`.
pub fn network_label(b: &Benchmark) -> String {
	if b.use_quic {
		return "quic".to_string();
	}
	if b.use_doh {
		let scheme = if b.server.starts_with("https://") { "https" } else { "http" };
		let proto = match b.doh_protocol {
			DohProtocol::Http1 => "1.1",
			DohProtocol::Http2 => "2",
			DohProtocol::Http3 => "3",
		};
		let method = match b.doh_method {
			DohMethod::Get => "GET",
			DohMethod::Post => "POST",
		};
		return format!("{}/{} ({})", scheme, proto, method);
	}
	if b.dot {
		Network::Tls.label().to_string()
	} else if b.tcp {
		Network::Tcp.label().to_string()
	} else {
		Network::Udp.label().to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn prepared(server: &str, f: impl FnOnce(&mut Benchmark)) -> Benchmark {
		let mut b = Benchmark {
			server: server.to_string(),
			..Default::default()
		};
		f(&mut b);
		b.prepare().unwrap();
		b
	}

	#[test]
	fn test_network_labels() {
		assert_eq!(network_label(&prepared("1.1.1.1", |_| {})), "udp");
		assert_eq!(network_label(&prepared("1.1.1.1", |b| b.tcp = true)), "tcp");
		assert_eq!(network_label(&prepared("1.1.1.1", |b| b.dot = true)), "tcp-tls");
		assert_eq!(network_label(&prepared("quic://1.1.1.1", |_| {})), "quic");
		assert_eq!(
			network_label(&prepared("https://1.1.1.1", |_| {})),
			"https/1.1 (POST)"
		);
		assert_eq!(
			network_label(&prepared("https://1.1.1.1", |b| {
				b.doh_protocol = DohProtocol::Http2;
				b.doh_method = DohMethod::Get;
			})),
			"https/2 (GET)"
		);
		assert_eq!(
			network_label(&prepared("http://1.1.1.1", |b| b.doh_protocol = DohProtocol::Http3)),
			"http/3 (POST)"
		);
	}

	#[test]
	fn test_shared_client_selection() {
		let plain = build_shared(&prepared("1.1.1.1", |_| {})).unwrap();
		assert!(matches!(plain, SharedClient::PerWorker));

		let doh = build_shared(&prepared("https://1.1.1.1", |_| {})).unwrap();
		assert!(matches!(doh, SharedClient::Doh(_)));

		let doq = build_shared(&prepared("quic://1.1.1.1", |_| {})).unwrap();
		assert!(matches!(doq, SharedClient::Doq(_)));
	}
}
