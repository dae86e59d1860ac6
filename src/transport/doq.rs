use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hickory_proto::op::Message;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Benchmark;
use crate::transport::plain::{read_with_length_prefix, write_with_length_prefix};
use crate::transport::tls;

/// DNS-over-QUIC client shared by all workers (RFC 9250).
///
/// One QUIC connection multiplexes all queries; each exchange opens a
/// fresh bidirectional stream carrying a single 2-byte length-prefixed
/// DNS message in each direction. A stale connection is dropped and
/// rebuilt on the next exchange.
pub struct DoqClient {
	server: String,
	server_name: String,
	endpoint: quinn::Endpoint,
	conn: Mutex<Option<quinn::Connection>>,
	connect_timeout: Duration,
	read_timeout: Duration,
	write_timeout: Duration,
}

impl DoqClient {
	pub fn new(b: &Benchmark) -> Result<Self> {
		let tls_config = tls::client_config(b.insecure, Some(b"doq"));
		let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
			.map_err(|e| anyhow!("failed to build QUIC TLS config: {}", e))?;
		let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("valid bind address"))
			.context("failed to create QUIC client endpoint")?;
		endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_config)));

		Ok(DoqClient {
			server: b.server.clone(),
			server_name: b.server_host().to_string(),
			endpoint,
			conn: Mutex::new(None),
			connect_timeout: b.connect_timeout,
			read_timeout: b.read_timeout,
			write_timeout: b.write_timeout,
		})
	}

	/// Send one query and await the response on a dedicated stream.
	pub async fn exchange(&self, msg: &Message) -> Result<Message> {
		let wire = msg
			.to_vec()
			.map_err(|e| anyhow!("failed to serialize query: {}", e))?;

		let conn = self.get_or_connect().await?;
		let response = match self.exchange_on(&conn, &wire).await {
			Ok(response) => response,
			Err(_) => {
				// Stale connection, rebuild once and retry.
				debug!(server = %self.server, "quic connection stale, reconnecting");
				let mut guard = self.conn.lock().await;
				*guard = None;
				drop(guard);
				let conn = self.get_or_connect().await?;
				self.exchange_on(&conn, &wire).await?
			}
		};

		Message::from_vec(&response)
			.map_err(|e| anyhow!("read quic {}: malformed response: {}", self.server, e))
	}

	async fn get_or_connect(&self) -> Result<quinn::Connection> {
		let mut guard = self.conn.lock().await;
		if let Some(conn) = guard.as_ref() {
			if conn.close_reason().is_none() {
				return Ok(conn.clone());
			}
			*guard = None;
		}
		let conn = self.connect_new().await?;
		*guard = Some(conn.clone());
		Ok(conn)
	}

	async fn connect_new(&self) -> Result<quinn::Connection> {
		let addr = tokio::net::lookup_host(&self.server)
			.await
			.map_err(|e| anyhow!("lookup {}: {}", self.server, e))?
			.next()
			.ok_or_else(|| anyhow!("lookup {}: no address found", self.server))?;

		let connecting = self
			.endpoint
			.connect(addr, &self.server_name)
			.map_err(|e| anyhow!("dial quic {}: {}", self.server, e))?;
		let conn = tokio::time::timeout(self.connect_timeout, connecting)
			.await
			.map_err(|_| anyhow!("dial quic {}: i/o timeout", self.server))?
			.map_err(|e| anyhow!("dial quic {}: {}", self.server, e))?;
		debug!(server = %self.server, "quic connection established");
		Ok(conn)
	}

	async fn exchange_on(&self, conn: &quinn::Connection, wire: &[u8]) -> Result<Vec<u8>> {
		let (mut send, mut recv) = conn
			.open_bi()
			.await
			.map_err(|e| anyhow!("stream quic {}: {}", self.server, e))?;

		tokio::time::timeout(self.write_timeout, write_with_length_prefix(&mut send, wire))
			.await
			.map_err(|_| anyhow!("write quic {}: i/o timeout", self.server))?
			.map_err(|e| anyhow!("write quic {}: {}", self.server, e))?;
		send.finish()
			.map_err(|e| anyhow!("write quic {}: {}", self.server, e))?;

		tokio::time::timeout(self.read_timeout, read_with_length_prefix(&mut recv))
			.await
			.map_err(|_| anyhow!("read quic {}: i/o timeout", self.server))?
			.map_err(|e| anyhow!("read quic {}: {}", self.server, e))
	}
}
