use educe::Educe;
use eyre::bail;
use figment::{
	Figment,
	providers::{Env, Serialized},
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Process configuration, resolved once at startup and immutable after.
///
/// All fields are strings on purpose: they arrive from flags and the
/// environment, and the services parse what they need. Defaults match the
/// historical ones, so existing deployments keep working unconfigured.
#[derive(Debug, Clone, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct Config {
	/// Run mode: `server` or `client`.
	#[educe(Default = "server")]
	pub mode: String,

	/// Pre-shared transmission password.
	#[educe(Default = "bargo")]
	pub key: String,

	/// Where the server listens / where the client dials.
	pub server_host: String,

	#[educe(Default = "50088")]
	pub server_port: String,

	/// Client listen host; empty means every interface.
	pub client_host: String,

	/// SOCKS5 (TCP) and UDP relay port on the client.
	#[educe(Default = "1080")]
	pub client_socks_port: String,

	/// HTTP front-end port on the client.
	#[educe(Default = "1081")]
	pub client_http_port: String,

	/// `socks5`, `http-all` or `http-auto`.
	#[educe(Default = "socks5")]
	pub client_proxy_mode: String,

	/// Hosts that bypass the tunnel in http-auto mode, `|` separated.
	pub client_whitelist: String,

	/// Hosts that always take the tunnel in http-auto mode, `|` separated.
	pub client_blacklist: String,

	/// Toggle the OS http proxy in http modes: `on` or `off`.
	#[educe(Default = "on")]
	pub client_sysproxy: String,
}

impl Config {
	/// Defaults, overlaid with `bargo_*` environment variables, overlaid
	/// with explicit CLI flags.
	pub fn load(cli: &Cli) -> eyre::Result<Self> {
		let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
			.merge(Env::prefixed("bargo_"))
			.extract()?;
		cli.apply(&mut config);
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> eyre::Result<()> {
		if self.mode != "server" && self.mode != "client" {
			bail!("please input a correct mode: server or client");
		}
		if self.mode == "client" && self.server_host.is_empty() {
			bail!("please input -server-host");
		}
		Ok(())
	}

	pub fn is_client(&self) -> bool {
		self.mode == "client"
	}

	/// `server_host:server_port` — the tunnel endpoint.
	pub fn server_addr(&self) -> String {
		format!("{}:{}", self.server_host, self.server_port)
	}

	/// Where the SOCKS5/UDP services listen.
	pub fn socks_listen_addr(&self) -> String {
		format!("{}:{}", host_or_any(&self.client_host), self.client_socks_port)
	}

	/// Where the HTTP front-end listens.
	pub fn http_listen_addr(&self) -> String {
		format!("{}:{}", host_or_any(&self.client_host), self.client_http_port)
	}

	/// Where the tunnel server listens.
	pub fn server_listen_addr(&self) -> String {
		format!("{}:{}", host_or_any(&self.server_host), self.server_port)
	}

	pub fn socks_port(&self) -> eyre::Result<u16> {
		Ok(self.client_socks_port.parse()?)
	}
}

fn host_or_any(host: &str) -> &str {
	if host.is_empty() { "0.0.0.0" } else { host }
}
