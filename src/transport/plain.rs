use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::Benchmark;
use crate::transport::tls;

/// Maximum DNS message size accepted from the wire.
pub(crate) const MAX_MESSAGE_SIZE: usize = 65535;

/// Response buffer size for UDP, large enough for EDNS-extended answers.
const UDP_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
	Udp,
	Tcp,
	Tls,
}

impl Network {
	pub fn label(self) -> &'static str {
		match self {
			Network::Udp => "udp",
			Network::Tcp => "tcp",
			Network::Tls => "tcp-tls",
		}
	}
}

/// Plain DNS (UDP/TCP) and DoT client owned by a single worker.
///
/// Holds one persistent connection that is redialed lazily: on first use,
/// after an I/O error, and after `qper_conn` queries when rotation is
/// configured. Nothing here is shared between workers.
pub struct PlainClient {
	network: Network,
	server: String,
	tls_connector: Option<TlsConnector>,
	connect_timeout: Duration,
	read_timeout: Duration,
	write_timeout: Duration,
	qper_conn: i64,
	conn: Option<DnsConn>,
	sent_on_conn: u64,
	/// Number of dial events, exposed for rotation accounting.
	pub dials: u64,
}

impl PlainClient {
	pub fn new(b: &Benchmark) -> Self {
		let network = if b.dot {
			Network::Tls
		} else if b.tcp {
			Network::Tcp
		} else {
			Network::Udp
		};
		let tls_connector = (network == Network::Tls)
			.then(|| TlsConnector::from(Arc::new(tls::client_config(b.insecure, None))));
		PlainClient {
			network,
			server: b.server.clone(),
			tls_connector,
			connect_timeout: b.connect_timeout,
			read_timeout: b.read_timeout,
			write_timeout: b.write_timeout,
			qper_conn: b.qper_conn,
			conn: None,
			sent_on_conn: 0,
			dials: 0,
		}
	}

	/// Send one query over the persistent connection and await the response.
	pub async fn exchange(&mut self, msg: &Message) -> Result<Message> {
		let request = msg
			.to_vec()
			.map_err(|e| anyhow!("failed to serialize query: {}", e))?;

		if self.conn.is_some() && self.qper_conn > 0 && self.sent_on_conn >= self.qper_conn as u64 {
			debug!(sent = self.sent_on_conn, "recycling connection");
			self.conn = None;
		}

		if self.conn.is_none() {
			self.conn = Some(self.dial().await?);
			self.sent_on_conn = 0;
			self.dials += 1;
		}
		let conn = self.conn.as_mut().expect("connection dialed above");

		match conn
			.exchange(&request, self.write_timeout, self.read_timeout)
			.await
		{
			Ok(response) => {
				self.sent_on_conn += 1;
				Message::from_vec(&response).map_err(|e| {
					// A garbled response also poisons the connection state.
					self.conn = None;
					anyhow!("read {} {}: malformed response: {}", self.network.label(), self.server, e)
				})
			}
			Err(e) => {
				self.conn = None;
				Err(anyhow!("{} {} {}: {}", e.op, self.network.label(), self.server, e.source))
			}
		}
	}

	async fn dial(&self) -> Result<DnsConn> {
		let label = self.network.label();
		match self.network {
			Network::Udp => {
				let remote = resolve(&self.server).await?;
				let bind_addr = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
				let socket = UdpSocket::bind(bind_addr)
					.await
					.map_err(|e| anyhow!("dial {} {}: {}", label, self.server, e))?;
				with_timeout(self.connect_timeout, socket.connect(remote))
					.await
					.map_err(|e| anyhow!("dial {} {}: {}", label, self.server, e))?;
				debug!(server = %self.server, "udp socket connected");
				Ok(DnsConn::Udp(socket))
			}
			Network::Tcp => {
				let stream = with_timeout(self.connect_timeout, TcpStream::connect(&self.server))
					.await
					.map_err(|e| anyhow!("dial {} {}: {}", label, self.server, e))?;
				debug!(server = %self.server, "tcp connection established");
				Ok(DnsConn::Tcp(stream))
			}
			Network::Tls => {
				let connector = self
					.tls_connector
					.clone()
					.expect("tls connector built for tcp-tls");
				let host = crate::config::split_host_port(&self.server).0.to_string();
				let server_name = ServerName::try_from(host)
					.map_err(|e| anyhow!("dial {} {}: invalid TLS name: {}", label, self.server, e))?;
				let tcp = with_timeout(self.connect_timeout, TcpStream::connect(&self.server))
					.await
					.map_err(|e| anyhow!("dial {} {}: {}", label, self.server, e))?;
				let stream = with_timeout(self.connect_timeout, connector.connect(server_name, tcp))
					.await
					.map_err(|e| anyhow!("dial {} {}: TLS handshake: {}", label, self.server, e))?;
				debug!(server = %self.server, "tls connection established");
				Ok(DnsConn::Tls(Box::new(stream)))
			}
		}
	}
}

/// One persistent transport connection.
enum DnsConn {
	Udp(UdpSocket),
	Tcp(TcpStream),
	Tls(Box<TlsStream<TcpStream>>),
}

/// I/O failure tagged with the phase it happened in.
struct ExchangeIoError {
	op: &'static str,
	source: io::Error,
}

impl DnsConn {
	async fn exchange(
		&mut self,
		request: &[u8],
		write_timeout: Duration,
		read_timeout: Duration,
	) -> std::result::Result<Vec<u8>, ExchangeIoError> {
		match self {
			DnsConn::Udp(socket) => {
				with_timeout(write_timeout, socket.send(request))
					.await
					.map_err(|e| ExchangeIoError { op: "write", source: e })?;
				let mut buf = vec![0u8; UDP_BUFFER_SIZE];
				let len = with_timeout(read_timeout, socket.recv(&mut buf))
					.await
					.map_err(|e| ExchangeIoError { op: "read", source: e })?;
				buf.truncate(len);
				Ok(buf)
			}
			DnsConn::Tcp(stream) => exchange_framed(stream, request, write_timeout, read_timeout).await,
			DnsConn::Tls(stream) => {
				exchange_framed(stream.as_mut(), request, write_timeout, read_timeout).await
			}
		}
	}
}

async fn exchange_framed<S>(
	stream: &mut S,
	request: &[u8],
	write_timeout: Duration,
	read_timeout: Duration,
) -> std::result::Result<Vec<u8>, ExchangeIoError>
where
	S: AsyncReadExt + AsyncWriteExt + Unpin,
{
	with_timeout(write_timeout, write_with_length_prefix(stream, request))
		.await
		.map_err(|e| ExchangeIoError { op: "write", source: e })?;
	with_timeout(read_timeout, read_with_length_prefix(stream))
		.await
		.map_err(|e| ExchangeIoError { op: "read", source: e })
}

/// Write a DNS message with the 2-byte big-endian length prefix used by
/// DNS over TCP, TLS and QUIC streams.
pub(crate) async fn write_with_length_prefix<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
	S: AsyncWriteExt + Unpin,
{
	let length = (message.len() as u16).to_be_bytes();
	stream.write_all(&length).await?;
	stream.write_all(message).await?;
	stream.flush().await
}

/// Read one length-prefixed DNS message.
pub(crate) async fn read_with_length_prefix<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
	S: AsyncReadExt + Unpin,
{
	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf).await?;
	let response_len = u16::from_be_bytes(len_buf) as usize;
	if response_len > MAX_MESSAGE_SIZE {
		return Err(io::Error::new(
			io::ErrorKind::InvalidData,
			format!("response too large: {} bytes", response_len),
		));
	}
	let mut response = vec![0u8; response_len];
	stream.read_exact(&mut response).await?;
	Ok(response)
}

async fn resolve(server: &str) -> Result<std::net::SocketAddr> {
	tokio::net::lookup_host(server)
		.await
		.map_err(|e| anyhow!("lookup {}: {}", server, e))?
		.next()
		.ok_or_else(|| anyhow!("lookup {}: no address found", server))
}

/// Apply `d` as a timeout unless it is zero, surfacing expiry as an
/// `io::Error` so all transport failures share one error shape.
async fn with_timeout<T, F>(d: Duration, fut: F) -> io::Result<T>
where
	F: Future<Output = io::Result<T>>,
{
	if d.is_zero() {
		return fut.await;
	}
	match tokio::time::timeout(d, fut).await {
		Ok(result) => result,
		Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")),
	}
}
