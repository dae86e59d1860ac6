//! Local stub DNS servers for exercising transports and the benchmark
//! loop without touching the network.

use std::net::SocketAddr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

/// Answer a request the way the stub resolver would: echo the message as
/// a response, NXDOMAIN for anything under `nxdomain.test.`.
fn answer(request: &[u8]) -> Option<Vec<u8>> {
	let mut msg = Message::from_vec(request).ok()?;
	msg.set_message_type(MessageType::Response);
	let negative = msg
		.queries()
		.first()
		.map(|q| q.name().to_string().ends_with("nxdomain.test."))
		.unwrap_or(false);
	if negative {
		msg.set_response_code(ResponseCode::NXDomain);
	}
	msg.to_vec().ok()
}

/// Spawn a UDP stub resolver, returning its address. Runs until the test
/// runtime shuts down.
pub async fn spawn_udp_server() -> SocketAddr {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let addr = socket.local_addr().unwrap();
	tokio::spawn(async move {
		let mut buf = [0u8; 4096];
		loop {
			let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
				break;
			};
			if let Some(response) = answer(&buf[..len]) {
				let _ = socket.send_to(&response, peer).await;
			}
		}
	});
	addr
}

/// Spawn a TCP stub resolver speaking the 2-byte length-prefixed framing.
pub async fn spawn_tcp_server() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				loop {
					let mut len_buf = [0u8; 2];
					if stream.read_exact(&mut len_buf).await.is_err() {
						break;
					}
					let len = u16::from_be_bytes(len_buf) as usize;
					let mut request = vec![0u8; len];
					if stream.read_exact(&mut request).await.is_err() {
						break;
					}
					let Some(response) = answer(&request) else { break };
					let framed = [&(response.len() as u16).to_be_bytes()[..], &response].concat();
					if stream.write_all(&framed).await.is_err() {
						break;
					}
				}
			});
		}
	});
	addr
}
