use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use hickory_proto::op::Message;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{Benchmark, DohMethod, DohProtocol};
use crate::transport::tls;

/// Content type of DNS-over-HTTPS exchanges (RFC 8484).
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Non-2xx answer from the DoH server, kept as a typed error so the
/// status still lands in the per-status tally.
#[derive(Debug, thiserror::Error)]
#[error("doh server returned http status {status}")]
pub struct DohStatusError {
	pub status: u16,
}

/// DNS-over-HTTPS client shared by all workers.
///
/// HTTP/1.1 and HTTP/2 ride on one pooled reqwest client; HTTP/3 rides on
/// a dedicated quinn endpoint driven through the h3 crate. Either way the
/// client is internally synchronized, workers just clone the `Arc`.
pub struct DohClient {
	url: String,
	method: DohMethod,
	inner: DohInner,
}

enum DohInner {
	Http(reqwest::Client),
	H3(H3Client),
}

impl DohClient {
	pub fn new(b: &Benchmark) -> Result<Self> {
		let inner = match b.doh_protocol {
			DohProtocol::Http3 => DohInner::H3(H3Client::new(b)?),
			proto => {
				let mut builder = reqwest::Client::builder()
					.use_rustls_tls()
					.danger_accept_invalid_certs(b.insecure)
					.timeout(b.read_timeout)
					.connect_timeout(b.connect_timeout);
				builder = match proto {
					DohProtocol::Http2 => builder.http2_prior_knowledge(),
					_ => builder.http1_only(),
				};
				DohInner::Http(builder.build().context("failed to build DoH client")?)
			}
		};
		Ok(DohClient {
			url: b.server.clone(),
			method: b.doh_method,
			inner,
		})
	}

	/// Send one query, returning the parsed response and the HTTP status.
	pub async fn exchange(&self, msg: &Message) -> Result<(Message, u16)> {
		let wire = msg
			.to_vec()
			.map_err(|e| anyhow!("failed to serialize query: {}", e))?;

		let (status, body) = match &self.inner {
			DohInner::Http(client) => self.exchange_http(client, wire).await?,
			DohInner::H3(client) => client.exchange(&self.url, self.method, wire).await?,
		};
		if !(200..300).contains(&status) {
			return Err(DohStatusError { status }.into());
		}

		let response = Message::from_vec(&body)
			.map_err(|e| anyhow!("read doh {}: malformed response: {}", self.url, e))?;
		Ok((response, status))
	}

	async fn exchange_http(&self, client: &reqwest::Client, wire: Vec<u8>) -> Result<(u16, Bytes)> {
		let request = match self.method {
			DohMethod::Post => client
				.post(&self.url)
				.header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
				.header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
				.body(wire),
			DohMethod::Get => client
				.get(format!("{}?dns={}", self.url, BASE64_URL_SAFE_NO_PAD.encode(&wire)))
				.header(reqwest::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE),
		};

		let response = request
			.send()
			.await
			.map_err(|e| anyhow!("request doh {}: {}", self.url, e))?;
		let status = response.status().as_u16();
		let body = response
			.bytes()
			.await
			.map_err(|e| anyhow!("read doh {}: {}", self.url, e))?;
		debug!(url = %self.url, status, response_len = body.len(), "doh response received");
		Ok((status, body))
	}
}

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// DoH over HTTP/3: one quinn endpoint, one pooled request handle that is
/// rebuilt when the underlying connection goes stale.
struct H3Client {
	host: String,
	port: u16,
	endpoint: quinn::Endpoint,
	send_request: Mutex<Option<H3SendRequest>>,
	connect_timeout: Duration,
}

impl H3Client {
	fn new(b: &Benchmark) -> Result<Self> {
		let parsed = url::Url::parse(&b.server)
			.map_err(|e| anyhow!("invalid DoH server URL '{}': {}", b.server, e))?;
		let host = parsed
			.host_str()
			.ok_or_else(|| anyhow!("DoH server URL '{}' has no host", b.server))?
			.to_string();
		let port = parsed.port_or_known_default().unwrap_or(443);

		let tls_config = tls::client_config(b.insecure, Some(b"h3"));
		let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(Arc::new(tls_config))
			.map_err(|e| anyhow!("failed to build QUIC TLS config: {}", e))?;
		let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("valid bind address"))
			.context("failed to create QUIC client endpoint")?;
		endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_config)));

		Ok(H3Client {
			host,
			port,
			endpoint,
			send_request: Mutex::new(None),
			connect_timeout: b.connect_timeout,
		})
	}

	async fn exchange(&self, url: &str, method: DohMethod, wire: Vec<u8>) -> Result<(u16, Bytes)> {
		let mut handle = self.get_or_connect().await?;
		match Self::execute(&mut handle, url, method, &wire).await {
			Ok(result) => Ok(result),
			Err(_) => {
				// Stale connection, rebuild once and retry.
				debug!(host = %self.host, "h3 connection stale, reconnecting");
				let mut guard = self.send_request.lock().await;
				*guard = None;
				drop(guard);
				let mut handle = self.get_or_connect().await?;
				Self::execute(&mut handle, url, method, &wire).await
			}
		}
	}

	async fn get_or_connect(&self) -> Result<H3SendRequest> {
		let mut guard = self.send_request.lock().await;
		if let Some(handle) = guard.as_ref() {
			return Ok(handle.clone());
		}
		let handle = self.connect_new().await?;
		*guard = Some(handle.clone());
		Ok(handle)
	}

	async fn connect_new(&self) -> Result<H3SendRequest> {
		let target = format!("{}:{}", self.host, self.port);
		let addr = tokio::net::lookup_host(&target)
			.await
			.map_err(|e| anyhow!("lookup {}: {}", target, e))?
			.next()
			.ok_or_else(|| anyhow!("lookup {}: no address found", target))?;

		let connecting = self
			.endpoint
			.connect(addr, &self.host)
			.map_err(|e| anyhow!("dial h3 {}: {}", target, e))?;
		let quinn_conn = tokio::time::timeout(self.connect_timeout, connecting)
			.await
			.map_err(|_| anyhow!("dial h3 {}: i/o timeout", target))?
			.map_err(|e| anyhow!("dial h3 {}: {}", target, e))?;

		let h3_conn = h3_quinn::Connection::new(quinn_conn);
		let (mut driver, send_request) = h3::client::new(h3_conn)
			.await
			.map_err(|e| anyhow!("dial h3 {}: {}", target, e))?;
		tokio::spawn(async move {
			let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
		});
		debug!(server = %target, "h3 connection established");
		Ok(send_request)
	}

	async fn execute(
		handle: &mut H3SendRequest,
		url: &str,
		method: DohMethod,
		wire: &[u8],
	) -> Result<(u16, Bytes)> {
		let request = match method {
			DohMethod::Post => http::Request::builder()
				.method(http::Method::POST)
				.uri(url)
				.header(http::header::CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
				.header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
				.body(())?,
			DohMethod::Get => http::Request::builder()
				.method(http::Method::GET)
				.uri(format!("{}?dns={}", url, BASE64_URL_SAFE_NO_PAD.encode(wire)))
				.header(http::header::ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
				.body(())?,
		};

		let mut stream = handle
			.send_request(request)
			.await
			.map_err(|e| anyhow!("request h3 {}: {}", url, e))?;
		if method == DohMethod::Post {
			stream
				.send_data(Bytes::copy_from_slice(wire))
				.await
				.map_err(|e| anyhow!("write h3 {}: {}", url, e))?;
		}
		stream
			.finish()
			.await
			.map_err(|e| anyhow!("write h3 {}: {}", url, e))?;

		let response = stream
			.recv_response()
			.await
			.map_err(|e| anyhow!("read h3 {}: {}", url, e))?;
		let status = response.status().as_u16();

		let mut body = BytesMut::new();
		while let Some(mut chunk) = stream
			.recv_data()
			.await
			.map_err(|e| anyhow!("read h3 {}: {}", url, e))?
		{
			body.extend_from_slice(chunk.chunk());
			chunk.advance(chunk.remaining());
		}
		Ok((status, body.freeze()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::{MessageType, Query};
	use hickory_proto::rr::{Name, RecordType};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	fn config(url: &str, method: DohMethod) -> Benchmark {
		let mut b = Benchmark {
			server: url.to_string(),
			doh_method: method,
			..Default::default()
		};
		b.prepare().unwrap();
		b
	}

	fn query(id: u16) -> Message {
		let mut msg = Message::new();
		msg.set_id(id);
		msg.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));
		msg
	}

	/// Minimal HTTP/1.1 DoH stub: answers every request with the echoed
	/// DNS message, or the configured status with an empty body.
	async fn spawn_doh_stub(status: u16) -> std::net::SocketAddr {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			while let Ok((mut stream, _)) = listener.accept().await {
				tokio::spawn(async move {
					let mut buf = Vec::new();
					let mut chunk = [0u8; 1024];
					// Read until the full POST body arrived.
					let body = loop {
						let Ok(n) = stream.read(&mut chunk).await else { return };
						if n == 0 {
							return;
						}
						buf.extend_from_slice(&chunk[..n]);
						if let Some(pos) = find_header_end(&buf) {
							let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
							let len = headers
								.lines()
								.find_map(|l| l.strip_prefix("content-length:"))
								.and_then(|v| v.trim().parse::<usize>().ok())
								.unwrap_or(0);
							if buf.len() >= pos + 4 + len {
								break buf[pos + 4..pos + 4 + len].to_vec();
							}
						}
					};
					let mut msg = Message::from_vec(&body).unwrap_or_else(|_| Message::new());
					msg.set_message_type(MessageType::Response);
					let payload = if status == 200 { msg.to_vec().unwrap() } else { Vec::new() };
					let head = format!(
						"HTTP/1.1 {} X\r\ncontent-type: application/dns-message\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
						status,
						payload.len()
					);
					let _ = stream.write_all(head.as_bytes()).await;
					let _ = stream.write_all(&payload).await;
				});
			}
		});
		addr
	}

	fn find_header_end(buf: &[u8]) -> Option<usize> {
		buf.windows(4).position(|w| w == b"\r\n\r\n")
	}

	#[tokio::test]
	async fn test_post_exchange() {
		let addr = spawn_doh_stub(200).await;
		let b = config(&format!("http://{}/dns-query", addr), DohMethod::Post);
		let client = DohClient::new(&b).unwrap();
		let (response, status) = client.exchange(&query(5)).await.unwrap();
		assert_eq!(status, 200);
		assert_eq!(response.id(), 5);
		assert_eq!(response.message_type(), MessageType::Response);
	}

	#[tokio::test]
	async fn test_non_2xx_surfaces_typed_status_error() {
		let addr = spawn_doh_stub(503).await;
		let b = config(&format!("http://{}/dns-query", addr), DohMethod::Post);
		let client = DohClient::new(&b).unwrap();
		let err = client.exchange(&query(5)).await.unwrap_err();
		let status_err = err.downcast_ref::<DohStatusError>().expect("typed status error");
		assert_eq!(status_err.status, 503);
	}

	#[test]
	fn test_get_url_encoding_is_base64url_without_padding() {
		let wire = query(1).to_vec().unwrap();
		let encoded = BASE64_URL_SAFE_NO_PAD.encode(&wire);
		assert!(!encoded.contains('='));
		assert!(!encoded.contains('+'));
		assert!(!encoded.contains('/'));
	}
}
