//! End-to-end tests: full client and server services on loopback, throwaway
//! echo origins, and the `fast-socks5` client driving the SOCKS5 surface.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bargo::{conf::Config, http::HttpService, pac::RuleEngine, tcp::TcpService, udp::UdpService};
use bargo_bars::{
	cipher::AesGcmCipher,
	frame::{FrameType, send_frame},
};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, TcpStream, UdpSocket},
	time::{sleep, timeout},
};

const KEY: &str = "password";

fn free_port() -> u16 {
	let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
	listener.local_addr().unwrap().port()
}

fn cipher() -> Arc<AesGcmCipher> {
	Arc::new(AesGcmCipher::new(KEY.as_bytes()))
}

fn server_config(server_port: u16) -> Arc<Config> {
	let mut config = Config::default();
	config.mode = "server".into();
	config.key = KEY.into();
	config.server_host = "127.0.0.1".into();
	config.server_port = server_port.to_string();
	Arc::new(config)
}

fn client_config(server_port: u16, socks_port: u16, http_port: u16, proxy_mode: &str) -> Arc<Config> {
	let mut config = Config::default();
	config.mode = "client".into();
	config.key = KEY.into();
	config.server_host = "127.0.0.1".into();
	config.server_port = server_port.to_string();
	config.client_host = "127.0.0.1".into();
	config.client_socks_port = socks_port.to_string();
	config.client_http_port = http_port.to_string();
	config.client_proxy_mode = proxy_mode.into();
	Arc::new(config)
}

fn spawn_tcp_service(cfg: Arc<Config>) {
	let service = TcpService::new(cfg, cipher());
	tokio::spawn(async move {
		let _ = service.run().await;
	});
}

fn spawn_udp_service(cfg: Arc<Config>) {
	let service = UdpService::new(cfg, cipher());
	tokio::spawn(async move {
		let _ = service.run().await;
	});
}

async fn spawn_tcp_echo() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 4096];
				loop {
					match stream.read(&mut buf).await {
						Ok(0) | Err(_) => break,
						Ok(read) => {
							if stream.write_all(&buf[..read]).await.is_err() {
								break;
							}
						}
					}
				}
			});
		}
	});
	port
}

async fn spawn_udp_echo() -> u16 {
	let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
	let port = socket.local_addr().unwrap().port();
	tokio::spawn(async move {
		let mut buf = vec![0u8; 65536];
		while let Ok((read, peer)) = socket.recv_from(&mut buf).await {
			let _ = socket.send_to(&buf[..read], peer).await;
		}
	});
	port
}

#[test_log::test(tokio::test)]
async fn tcp_connect_through_tunnel() -> eyre::Result<()> {
	let echo_port = spawn_tcp_echo().await;
	let server_port = free_port();
	let socks_port = free_port();

	spawn_tcp_service(server_config(server_port));
	spawn_tcp_service(client_config(server_port, socks_port, free_port(), "socks5"));
	sleep(Duration::from_millis(300)).await;

	let proxy_addr = format!("127.0.0.1:{socks_port}");
	let mut stream = fast_socks5::client::Socks5Stream::connect(
		proxy_addr.as_str(),
		"127.0.0.1".to_string(),
		echo_port,
		fast_socks5::client::Config::default(),
	)
	.await?;

	stream.write_all(b"ping").await?;
	let mut buf = [0u8; 4];
	timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await??;
	assert_eq!(&buf, b"ping");
	Ok(())
}

#[test_log::test(tokio::test)]
async fn server_closes_on_non_link_first_frame() -> eyre::Result<()> {
	let server_port = free_port();
	spawn_tcp_service(server_config(server_port));
	sleep(Duration::from_millis(300)).await;

	let mut conn = TcpStream::connect(("127.0.0.1", server_port)).await?;
	send_frame(&mut conn, &cipher(), FrameType::Copy, b"not a link").await?;

	let mut buf = [0u8; 1];
	let read = timeout(Duration::from_secs(5), conn.read(&mut buf)).await??;
	assert_eq!(read, 0, "server should close the tunnel");
	Ok(())
}

#[test_log::test(tokio::test)]
async fn server_closes_on_oversized_first_frame() -> eyre::Result<()> {
	let server_port = free_port();
	spawn_tcp_service(server_config(server_port));
	sleep(Duration::from_millis(300)).await;

	let mut conn = TcpStream::connect(("127.0.0.1", server_port)).await?;
	let mut forged = Vec::new();
	forged.extend_from_slice(&34000u16.to_le_bytes());
	forged.extend_from_slice(&[0u8; 64]);
	conn.write_all(&forged).await?;

	// either a clean FIN or a reset, but never data back
	let mut buf = [0u8; 1];
	match timeout(Duration::from_secs(5), conn.read(&mut buf)).await? {
		Ok(read) => assert_eq!(read, 0, "server should close without dialing upstream"),
		Err(_) => {}
	}
	Ok(())
}

#[test_log::test(tokio::test)]
async fn udp_associate_roundtrip() -> eyre::Result<()> {
	let echo_port = spawn_udp_echo().await;
	let server_port = free_port();
	let socks_port = free_port();

	let server_cfg = server_config(server_port);
	spawn_tcp_service(server_cfg.clone());
	spawn_udp_service(server_cfg);
	let client_cfg = client_config(server_port, socks_port, free_port(), "socks5");
	spawn_tcp_service(client_cfg.clone());
	spawn_udp_service(client_cfg);
	sleep(Duration::from_millis(300)).await;

	let backing = TcpStream::connect(("127.0.0.1", socks_port)).await?;
	let local: SocketAddr = "127.0.0.1:0".parse()?;
	let socket = fast_socks5::client::Socks5Datagram::bind(backing, local).await?;

	socket.send_to(b"hi", ("127.0.0.1", echo_port)).await?;

	let mut buf = vec![0u8; 1024];
	let (read, _from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await??;
	assert_eq!(&buf[..read], b"hi");
	Ok(())
}

#[test_log::test(tokio::test)]
async fn http_forward_routes_direct() -> eyre::Result<()> {
	// a tiny origin that answers one sized response per connection
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let origin_port = listener.local_addr()?.port();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 4096];
				let mut head = Vec::new();
				loop {
					match stream.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(read) => {
							head.extend_from_slice(&buf[..read]);
							if head.windows(4).any(|window| window == b"\r\n\r\n") {
								break;
							}
						}
					}
				}
				let _ = stream
					.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
					.await;
			});
		}
	});

	let http_port = free_port();
	let cfg = client_config(free_port(), free_port(), http_port, "http-auto");
	// nothing on the black list matches loopback, so this goes direct
	let rules = Arc::new(RuleEngine::from_rules(Vec::new(), vec!["tunneled.example".into()]));
	let http = HttpService::new(cfg, Some(rules));
	tokio::spawn(async move {
		let _ = http.run().await;
	});
	sleep(Duration::from_millis(300)).await;

	let mut conn = TcpStream::connect(("127.0.0.1", http_port)).await?;
	let request = format!(
		"GET http://127.0.0.1:{origin_port}/ HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\nProxy-Connection: close\r\n\r\n"
	);
	conn.write_all(request.as_bytes()).await?;

	let mut response = Vec::new();
	timeout(Duration::from_secs(5), conn.read_to_end(&mut response)).await??;
	let response = String::from_utf8_lossy(&response);
	assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got {response:?}");
	assert!(response.ends_with("ok"), "got {response:?}");
	Ok(())
}

#[test_log::test(tokio::test)]
async fn http_connect_through_tunnel() -> eyre::Result<()> {
	let echo_port = spawn_tcp_echo().await;
	let server_port = free_port();
	let socks_port = free_port();
	let http_port = free_port();

	spawn_tcp_service(server_config(server_port));
	let client_cfg = client_config(server_port, socks_port, http_port, "http-all");
	spawn_tcp_service(client_cfg.clone());
	let http = HttpService::new(client_cfg, None);
	tokio::spawn(async move {
		let _ = http.run().await;
	});
	sleep(Duration::from_millis(300)).await;

	let mut conn = TcpStream::connect(("127.0.0.1", http_port)).await?;
	let request =
		format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n");
	conn.write_all(request.as_bytes()).await?;

	let established = b"HTTP/1.0 200 Connection Established\r\n\r\n";
	let mut reply = vec![0u8; established.len()];
	timeout(Duration::from_secs(5), conn.read_exact(&mut reply)).await??;
	assert_eq!(reply, established);

	conn.write_all(b"ping").await?;
	let mut buf = [0u8; 4];
	timeout(Duration::from_secs(5), conn.read_exact(&mut buf)).await??;
	assert_eq!(&buf, b"ping");
	Ok(())
}
