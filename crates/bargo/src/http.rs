//! The HTTP/1.1 forward-proxy front-end.
//!
//! Plain verbs are re-issued upstream (directly or through the local SOCKS5
//! service) with the head rewritten to origin form; CONNECT turns into a raw
//! byte relay once the upstream leg is up. In `http-auto` mode the rule
//! engine picks the leg per request; `http-all` tunnels everything.

use std::{sync::Arc, time::Duration};

use bargo_core::{debug, info, io::copy_io, task::spawn_logged};
use bargo_socks::client as socks_client;
use eyre::{Context, bail, ensure, eyre};
use tokio::{
	io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
	net::{TcpListener, TcpStream},
	time::timeout,
};

use crate::{conf::Config, pac::RuleEngine};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

pub struct HttpService {
	cfg:   Arc<Config>,
	rules: Option<Arc<RuleEngine>>,
}

impl HttpService {
	/// `rules` is consulted only in `http-auto` mode; without it every
	/// request takes the tunnel.
	pub fn new(cfg: Arc<Config>, rules: Option<Arc<RuleEngine>>) -> Self {
		Self { cfg, rules }
	}

	pub async fn run(&self) -> eyre::Result<()> {
		let listen_addr = self.cfg.http_listen_addr();
		let listener = TcpListener::bind(&listen_addr)
			.await
			.wrap_err_with(|| format!("failed to bind http service on {listen_addr}"))?;
		info!(target: "[HTTP]", "{} proxy listening on {}", self.cfg.client_proxy_mode, listen_addr);

		loop {
			let (conn, peer) = match listener.accept().await {
				Ok(accepted) => accepted,
				Err(err) => {
					debug!(target: "[HTTP]", "accept failed: {err}");
					continue;
				}
			};

			let cfg = self.cfg.clone();
			let rules = self.rules.clone();
			spawn_logged("http connection", async move {
				if let Err(err) = handle_connection(cfg, rules, conn).await {
					debug!(target: "[HTTP]", "connection from {peer} ended: {err:#}");
				}
			});
		}
	}
}

async fn handle_connection(
	cfg: Arc<Config>,
	rules: Option<Arc<RuleEngine>>,
	conn: TcpStream,
) -> eyre::Result<()> {
	let mut client = BufReader::new(conn);

	// keep-alive loop: one head at a time, fresh upstream per request
	loop {
		let Some(head) = read_head(&mut client).await? else {
			return Ok(());
		};
		let mut parts = head.line.split_whitespace();
		let method = parts.next().unwrap_or_default().to_string();
		let target = parts.next().unwrap_or_default().to_string();
		ensure!(!method.is_empty() && !target.is_empty(), "bad request line {:?}", head.line);

		if method.eq_ignore_ascii_case("CONNECT") {
			return handle_connect(&cfg, rules.as_deref(), client, &target).await;
		}

		if !handle_forward(&cfg, rules.as_deref(), &mut client, &head, &method, &target).await? {
			return Ok(());
		}
	}
}

fn use_tunnel(cfg: &Config, rules: Option<&RuleEngine>, host: &str) -> bool {
	if cfg.client_proxy_mode == "http-auto" {
		rules.map(|rules| rules.is_need_proxy(host)).unwrap_or(true)
	} else {
		true
	}
}

async fn dial(cfg: &Config, tunneled: bool, host: &str, port: u16) -> eyre::Result<TcpStream> {
	if tunneled {
		let socks_addr = format!("127.0.0.1:{}", cfg.client_socks_port);
		Ok(socks_client::connect(&socks_addr, host, port).await?)
	} else {
		timeout(DIAL_TIMEOUT, TcpStream::connect((host, port)))
			.await
			.map_err(|_| eyre!("dialing {host}:{port} timed out"))?
			.wrap_err_with(|| format!("failed to dial {host}:{port}"))
	}
}

/// CONNECT: bring up the upstream leg, report 200, then shovel bytes until
/// either side hangs up. The client connection is consumed.
async fn handle_connect(
	cfg: &Config,
	rules: Option<&RuleEngine>,
	mut client: BufReader<TcpStream>,
	target: &str,
) -> eyre::Result<()> {
	let (host, port) = split_host_port(target, 443)?;
	let tunneled = use_tunnel(cfg, rules, &host);
	let mut upstream = dial(cfg, tunneled, &host, port).await?;

	client.write_all(CONNECT_ESTABLISHED).await?;
	client.flush().await?;

	debug!(target: "[HTTP]", "connect {host}:{port} tunneled={tunneled}");
	let (sent, received, _err) = copy_io(&mut client, &mut upstream).await;
	debug!(target: "[HTTP]", "connect {host}:{port} done (sent {sent}, received {received})");
	Ok(())
}

/// Forward one plain request and relay exactly one response.
///
/// Returns whether the client connection can serve another request.
async fn handle_forward(
	cfg: &Config,
	rules: Option<&RuleEngine>,
	client: &mut BufReader<TcpStream>,
	head: &Head,
	method: &str,
	target: &str,
) -> eyre::Result<bool> {
	let (host, port, path) = split_absolute_target(target)?;
	let tunneled = use_tunnel(cfg, rules, &host);
	debug!(target: "[HTTP]", "{method} {host}:{port}{path} tunneled={tunneled}");

	let mut upstream = BufReader::new(dial(cfg, tunneled, &host, port).await?);

	// origin-form head, proxy hop headers replaced
	let mut request = format!("{method} {path} HTTP/1.1\r\n");
	for (name, value) in &head.headers {
		if name.eq_ignore_ascii_case("proxy-connection") || name.eq_ignore_ascii_case("connection") {
			continue;
		}
		request.push_str(name);
		request.push_str(": ");
		request.push_str(value);
		request.push_str("\r\n");
	}
	request.push_str("Connection: keep-alive\r\n\r\n");
	upstream.write_all(request.as_bytes()).await?;

	if head.is_chunked() {
		relay_chunked(client, &mut upstream).await?;
	} else if let Some(length) = head.content_length() {
		copy_exact(client, &mut upstream, length).await?;
	}
	upstream.flush().await?;

	let Some(response) = read_head(&mut upstream).await? else {
		bail!("upstream closed before responding");
	};

	let mut response_head = String::with_capacity(256);
	response_head.push_str(&response.line);
	response_head.push_str("\r\n");
	for (name, value) in &response.headers {
		response_head.push_str(name);
		response_head.push_str(": ");
		response_head.push_str(value);
		response_head.push_str("\r\n");
	}
	response_head.push_str("\r\n");
	client.write_all(response_head.as_bytes()).await?;

	let framed = if response.is_chunked() {
		relay_chunked(&mut upstream, client).await?;
		true
	} else if let Some(length) = response.content_length() {
		copy_exact(&mut upstream, client, length).await?;
		true
	} else {
		// no framing: relay until the origin hangs up, then the client
		// connection cannot be reused
		tokio::io::copy(&mut upstream, client).await?;
		false
	};
	client.flush().await?;

	let wants_close = head
		.get("proxy-connection")
		.or_else(|| head.get("connection"))
		.map(|value| value.eq_ignore_ascii_case("close"))
		.unwrap_or(false);
	Ok(framed && !wants_close)
}

/// One parsed HTTP/1.1 message head: the start line plus headers.
pub(crate) struct Head {
	pub line:    String,
	pub headers: Vec<(String, String)>,
}

impl Head {
	pub fn get(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	pub fn is_chunked(&self) -> bool {
		self.get("transfer-encoding")
			.map(|value| value.to_ascii_lowercase().contains("chunked"))
			.unwrap_or(false)
	}

	pub fn content_length(&self) -> Option<usize> {
		self.get("content-length").and_then(|value| value.trim().parse().ok())
	}
}

/// Read one message head. `None` means the peer closed between messages.
pub(crate) async fn read_head<R>(reader: &mut R) -> eyre::Result<Option<Head>>
where
	R: AsyncBufRead + Unpin + ?Sized,
{
	let mut line = String::new();
	if reader.read_line(&mut line).await? == 0 {
		return Ok(None);
	}
	let line = line.trim_end().to_string();
	ensure!(!line.is_empty(), "empty start line");

	let mut headers = Vec::new();
	loop {
		let mut header = String::new();
		if reader.read_line(&mut header).await? == 0 {
			bail!("eof inside header block");
		}
		let header = header.trim_end();
		if header.is_empty() {
			break;
		}
		if let Some((name, value)) = header.split_once(':') {
			headers.push((name.trim().to_string(), value.trim().to_string()));
		}
		ensure!(headers.len() <= 128, "too many headers");
	}

	Ok(Some(Head { line, headers }))
}

/// Read a message body into memory, for internal clients of [`read_head`].
pub(crate) async fn read_body<R>(reader: &mut R, head: &Head) -> eyre::Result<Vec<u8>>
where
	R: AsyncBufRead + Unpin + ?Sized,
{
	if head.is_chunked() {
		let mut body = Vec::new();
		loop {
			let mut size_line = String::new();
			ensure!(reader.read_line(&mut size_line).await? > 0, "eof inside chunked body");
			let size = chunk_size(&size_line)?;
			let start = body.len();
			body.resize(start + size, 0);
			reader.read_exact(&mut body[start..]).await?;
			let mut crlf = [0u8; 2];
			reader.read_exact(&mut crlf).await?;
			if size == 0 {
				break;
			}
		}
		Ok(body)
	} else if let Some(length) = head.content_length() {
		let mut body = vec![0u8; length];
		reader.read_exact(&mut body).await?;
		Ok(body)
	} else {
		let mut body = Vec::new();
		reader.read_to_end(&mut body).await?;
		Ok(body)
	}
}

fn chunk_size(line: &str) -> eyre::Result<usize> {
	let digits = line.trim().split(';').next().unwrap_or_default();
	usize::from_str_radix(digits, 16).wrap_err_with(|| format!("bad chunk size {digits:?}"))
}

/// Pass a chunked body through verbatim, framing included.
async fn relay_chunked<R, W>(reader: &mut R, writer: &mut W) -> eyre::Result<()>
where
	R: AsyncBufRead + Unpin + ?Sized,
	W: AsyncWrite + Unpin + ?Sized,
{
	loop {
		let mut size_line = String::new();
		ensure!(reader.read_line(&mut size_line).await? > 0, "eof inside chunked body");
		writer.write_all(size_line.as_bytes()).await?;

		let size = chunk_size(&size_line)?;
		// chunk data plus its trailing CRLF
		copy_exact(reader, writer, size + 2).await?;
		if size == 0 {
			return Ok(());
		}
	}
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: usize) -> eyre::Result<()>
where
	R: AsyncBufRead + Unpin + ?Sized,
	W: AsyncWrite + Unpin + ?Sized,
{
	let mut buf = [0u8; 8 * 1024];
	while remaining > 0 {
		let want = remaining.min(buf.len());
		let read = reader.read(&mut buf[..want]).await?;
		ensure!(read > 0, "eof inside message body");
		writer.write_all(&buf[..read]).await?;
		remaining -= read;
	}
	Ok(())
}

/// `host[:port]`, with IPv6 literals in brackets.
fn split_host_port(authority: &str, default_port: u16) -> eyre::Result<(String, u16)> {
	if let Some(rest) = authority.strip_prefix('[') {
		let end = rest.find(']').ok_or_else(|| eyre!("unclosed ipv6 literal {authority:?}"))?;
		let host = rest[..end].to_string();
		let port = match rest[end + 1..].strip_prefix(':') {
			Some(port) => port.parse()?,
			None => default_port,
		};
		return Ok((host, port));
	}

	match authority.rfind(':') {
		Some(idx) if !authority[..idx].contains(':') => {
			Ok((authority[..idx].to_string(), authority[idx + 1..].parse()?))
		}
		_ => Ok((authority.to_string(), default_port)),
	}
}

/// Split `http://host[:port]/path` into its pieces; the path keeps the query.
fn split_absolute_target(target: &str) -> eyre::Result<(String, u16, String)> {
	let rest = target.strip_prefix("http://").unwrap_or(target);
	let (authority, path) = match rest.find('/') {
		Some(idx) => (&rest[..idx], &rest[idx..]),
		None => (rest, "/"),
	};
	let (host, port) = split_host_port(authority, 80)?;
	Ok((host, port, path.to_string()))
}
