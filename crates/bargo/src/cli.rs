use clap::Parser;

use crate::conf::Config;

/// Command line surface. Every option can also come from an environment
/// variable (`bargo_<name>` with underscores); an explicit flag wins over
/// the environment, which wins over the compiled-in default.
#[derive(Parser, Debug, Default)]
#[command(name = "bargo", about, long_about = None)]
pub struct Cli {
	/// Run mode: server | client
	#[arg(long)]
	pub mode: Option<String>,

	/// Transmission password
	#[arg(long)]
	pub key: Option<String>,

	/// Server host
	#[arg(long = "server-host")]
	pub server_host: Option<String>,

	/// Server listen port
	#[arg(long = "server-port")]
	pub server_port: Option<String>,

	/// Client host
	#[arg(long = "client-host")]
	pub client_host: Option<String>,

	/// Client socks5 listen port
	#[arg(long = "client-socks-port")]
	pub client_socks_port: Option<String>,

	/// Client http listen port
	#[arg(long = "client-http-port")]
	pub client_http_port: Option<String>,

	/// Client proxy mode: socks5 | http-all | http-auto
	#[arg(long = "client-proxy-mode")]
	pub client_proxy_mode: Option<String>,

	/// Domains or ips that bypass the tunnel in http-auto mode, `|` separated
	#[arg(long = "client-whitelist")]
	pub client_whitelist: Option<String>,

	/// Domains or ips that always take the tunnel in http-auto mode, `|` separated
	#[arg(long = "client-blacklist")]
	pub client_blacklist: Option<String>,

	/// Set the system http proxy in http modes: on | off
	#[arg(long = "client-sysproxy")]
	pub client_sysproxy: Option<String>,
}

macro_rules! apply_field {
	($cli:expr, $config:expr, $($field:ident),+ $(,)?) => {
		$(
			if let Some(value) = &$cli.$field {
				$config.$field = value.clone();
			}
		)+
	};
}

impl Cli {
	/// Overlay explicitly given flags onto `config`.
	pub fn apply(&self, config: &mut Config) {
		apply_field!(
			self,
			config,
			mode,
			key,
			server_host,
			server_port,
			client_host,
			client_socks_port,
			client_http_port,
			client_proxy_mode,
			client_whitelist,
			client_blacklist,
			client_sysproxy,
		);
	}
}
