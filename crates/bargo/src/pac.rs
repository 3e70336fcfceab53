//! The split-tunneling rule engine.
//!
//! Two ordered lists of case-insensitive substring patterns decide whether a
//! host takes the tunnel: a white match wins and means direct, then a black
//! match means tunneled, anything else goes direct. The black list is seeded
//! from a gfwlist-style document cached on disk for a week and refreshed
//! from a fixed URL, with a compiled-in fallback.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	sync::{Arc, LazyLock},
	time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bargo_core::{debug, info};
use eyre::{Context, ensure, eyre};
use regex::Regex;
use tokio::{
	io::{AsyncWriteExt, BufReader},
	net::TcpStream,
	time::timeout,
};
use tokio_rustls::TlsConnector;

use crate::http::{read_body, read_head};

const GFWLIST_URL_HOST: &str = "raw.githubusercontent.com";
const GFWLIST_URL_PATH: &str = "/gfwlist/gfwlist/master/gfwlist.txt";

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// A remote answer shorter than this is considered bogus.
const MIN_REMOTE_SIZE: usize = 200;

/// Always-black substrings appended after the cached list.
const SUP_BLACK_RULES: [&str; 4] = ["google.", "youtube.", "facebook.", "twitter."];

#[derive(Debug, Clone, Copy)]
pub enum RuleKind {
	White,
	Black,
}

pub struct RuleEngine {
	white: Vec<String>,
	black: Vec<String>,
}

impl RuleEngine {
	/// Load the black list from the on-disk cache, refreshing it first when
	/// missing or older than a week.
	pub async fn init() -> eyre::Result<Self> {
		let mut black = load_black_rules().await?;
		black.extend(SUP_BLACK_RULES.iter().map(|rule| rule.to_string()));
		info!(target: "[PAC]", "{} black rules loaded", black.len());
		Ok(Self { white: Vec::new(), black })
	}

	pub fn from_rules(white: Vec<String>, black: Vec<String>) -> Self {
		Self { white, black }
	}

	/// Append user-supplied pipe-separated patterns.
	pub fn add_rules(&mut self, kind: RuleKind, rules: &str) {
		if rules.is_empty() {
			return;
		}
		let list = match kind {
			RuleKind::White => &mut self.white,
			RuleKind::Black => &mut self.black,
		};
		list.extend(rules.split('|').map(str::to_string));
	}

	/// White beats black beats direct.
	pub fn is_need_proxy(&self, host: &str) -> bool {
		let host = host.to_ascii_lowercase();
		for rule in &self.white {
			if !rule.is_empty() && host.contains(&rule.to_ascii_lowercase()) {
				return false;
			}
		}
		for rule in &self.black {
			if !rule.is_empty() && host.contains(&rule.to_ascii_lowercase()) {
				return true;
			}
		}
		false
	}
}

fn cache_path() -> PathBuf {
	std::env::temp_dir().join("bargo_pac.txt")
}

fn cache_is_stale(path: &Path) -> bool {
	match std::fs::metadata(path).and_then(|meta| meta.modified()) {
		Ok(modified) => modified
			.elapsed()
			.map(|age| age > CACHE_MAX_AGE)
			.unwrap_or(false),
		Err(_) => true,
	}
}

async fn load_black_rules() -> eyre::Result<Vec<String>> {
	let path = cache_path();
	if cache_is_stale(&path) {
		update_cache(&path).await?;
	}
	let data = std::fs::read_to_string(&path)
		.wrap_err_with(|| format!("failed to read rule cache {}", path.display()))?;
	Ok(data.lines().map(str::to_string).collect())
}

/// Rebuild the cache file: one deduplicated pattern per line.
async fn update_cache(path: &Path) -> eyre::Result<()> {
	let encoded = match fetch_remote_list().await {
		Ok(body) if body.len() > MIN_REMOTE_SIZE => body,
		Ok(body) => {
			debug!(target: "[PAC]", "remote list too small ({} bytes), using built-in", body.len());
			DEFAULT_GFWLIST.as_bytes().to_vec()
		}
		Err(err) => {
			debug!(target: "[PAC]", "remote list fetch failed ({err:#}), using built-in");
			DEFAULT_GFWLIST.as_bytes().to_vec()
		}
	};

	let compact: Vec<u8> = encoded
		.into_iter()
		.filter(|byte| !byte.is_ascii_whitespace())
		.collect();
	let decoded = BASE64.decode(&compact).wrap_err("rule list is not valid base64")?;

	let rules = parse_gfwlist(&decoded);
	let mut contents = rules.join("\n");
	contents.push('\n');
	std::fs::write(path, contents)
		.wrap_err_with(|| format!("failed to write rule cache {}", path.display()))?;
	Ok(())
}

/// Extract black-list domains from a gfwlist document.
///
/// Lines containing `!` or `[` are comments; `@@` lines are whitelist rules
/// and skipped; from everything else the first domain or dotted quad is
/// taken, once.
pub(crate) fn parse_gfwlist(text: &[u8]) -> Vec<String> {
	static COMMENT: LazyLock<Regex> =
		LazyLock::new(|| Regex::new(r"[!\[]").expect("static regex"));
	static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
		Regex::new(r"(?:(?:[a-zA-Z0-9\-]{1,61}\.)+[a-zA-Z]{2,6}|(?:\d{1,3}\.){3}\d{1,3})")
			.expect("static regex")
	});

	let text = String::from_utf8_lossy(text);
	let mut seen = HashSet::new();
	let mut rules = Vec::new();
	for line in text.lines() {
		if line.is_empty() || COMMENT.is_match(line) || line.starts_with("@@") {
			continue;
		}
		if let Some(found) = DOMAIN.find(line) {
			let domain = found.as_str().to_string();
			if seen.insert(domain.clone()) {
				rules.push(domain);
			}
		}
	}
	rules
}

async fn fetch_remote_list() -> eyre::Result<Vec<u8>> {
	timeout(FETCH_TIMEOUT, async {
		let stream = TcpStream::connect((GFWLIST_URL_HOST, 443)).await?;

		let connector = TlsConnector::from(Arc::new(tls_config()?));
		let server_name = rustls::pki_types::ServerName::try_from(GFWLIST_URL_HOST)?;
		let tls = connector.connect(server_name, stream).await?;

		let request = format!(
			"GET {GFWLIST_URL_PATH} HTTP/1.1\r\nHost: {GFWLIST_URL_HOST}\r\nUser-Agent: bargo\r\nAccept: */*\r\nConnection: close\r\n\r\n"
		);
		let mut reader = BufReader::new(tls);
		reader.write_all(request.as_bytes()).await?;
		reader.flush().await?;

		let head = read_head(&mut reader)
			.await?
			.ok_or_else(|| eyre!("empty rule list response"))?;
		ensure!(
			head.line.split_whitespace().nth(1) == Some("200"),
			"unexpected rule list status {:?}",
			head.line
		);
		read_body(&mut reader, &head).await
	})
	.await
	.map_err(|_| eyre!("rule list fetch timed out"))?
}

fn tls_config() -> eyre::Result<rustls::ClientConfig> {
	use rustls_platform_verifier::BuilderVerifierExt;

	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let config = rustls::ClientConfig::builder_with_provider(provider)
		.with_protocol_versions(&[&rustls::version::TLS13])
		.map_err(|err| eyre!("tls protocol setup failed: {err}"))?
		.with_platform_verifier()
		.map_err(|err| eyre!("platform verifier unavailable: {err}"))?
		.with_no_client_auth();
	Ok(config)
}

pub(crate) const DEFAULT_GFWLIST: &str = "W0F1dG9Qcm94eSAwLjIuOV0KISBDaGVja3N1bTogcGxhY2Vob2xkZXIKISBUaXRsZTogZGVmYXVs\
	dCBydWxlcwohIEV4cGlyZXM6IDcgZGF5cwohLS0tLS0tLS0tLS0tLS0tLS0tLS0tR2VuZXJhbCBM\
	aXN0IFN0YXJ0LS0tLS0tLS0tLS0tLS0tLS0tLS0KfHxnb29nbGUuY29tCnx8Z29vZ2xlLmNvbS5o\
	awp8fGdvb2dsZWFwaXMuY29tCnx8Z29vZ2xldmlkZW8uY29tCnx8Z29vZ2xldXNlcmNvbnRlbnQu\
	Y29tCnx8Z3N0YXRpYy5jb20KfHx5b3V0dWJlLmNvbQp8fHl0aW1nLmNvbQp8fGZhY2Vib29rLmNv\
	bQp8fGZiY2RuLm5ldAp8fHR3aXR0ZXIuY29tCnx8dHdpbWcuY29tCnx8dC5jbwp8fGluc3RhZ3Jh\
	bS5jb20KfHx3aGF0c2FwcC5jb20KfHx0ZWxlZ3JhbS5vcmcKfHx0Lm1lCnx8d2lraXBlZGlhLm9y\
	Zwp8fHdpa2ltZWRpYS5vcmcKfHxibG9nc3BvdC5jb20KfHxibG9nZ2VyLmNvbQp8fGdpdGh1Yi5p\
	bwp8fG1lZGl1bS5jb20KfHxyZWRkaXQuY29tCnx8cmVkZC5pdAp8fHZpbWVvLmNvbQp8fGRhaWx5\
	bW90aW9uLmNvbQp8fHNvdW5kY2xvdWQuY29tCnx8YXJjaGl2ZS5vcmcKfHxkcm9wYm94LmNvbQp8\
	fHNsaWRlc2hhcmUubmV0Cnx8c2NyaWJkLmNvbQp8fGR1Y2tkdWNrZ28uY29tCnx8c3RhcnRwYWdl\
	LmNvbQp8fGZsaWNrci5jb20KfHxpbWd1ci5jb20KfHxwaW50ZXJlc3QuY29tCnx8dHVtYmxyLmNv\
	bQp8fHR3aXRjaC50dgp8fG55dGltZXMuY29tCnx8d3NqLmNvbQp8fGJiYy5jby51awp8fHJldXRl\
	cnMuY29tCnx8Ymxvb21iZXJnLmNvbQp8fGVjb25vbWlzdC5jb20KfHx0aW1lLmNvbQp8aHR0cDov\
	LzguOC44LjgKfGh0dHA6Ly8xLjEuMS4xCkBAfHxjbi5iaW5nLmNvbQpAQHx8dHJhbnNsYXRlLmdv\
	b2dsZS5jbgohLS0tLS0tLS0tLS0tLS0tLS0tLS0tR2VuZXJhbCBMaXN0IEVuZC0tLS0tLS0tLS0t\
	LS0tLS0tLS0tLS0K";
