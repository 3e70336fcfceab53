use std::sync::Arc;

use bargo::{
	cli::Cli,
	conf::Config,
	http::HttpService,
	pac::{RuleEngine, RuleKind},
	tcp::TcpService,
	udp::UdpService,
};
use bargo_bars::cipher::AesGcmCipher;
use bargo_core::info;
use clap::Parser as _;
use tokio::task::JoinSet;
use tracing::Level;

#[tokio::main]
async fn main() -> eyre::Result<()> {
	let cli = Cli::parse();
	let config = match Config::load(&cli) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("{err}");
			std::process::exit(1);
		}
	};

	bargo::log::init_log(Level::DEBUG)?;
	info!(target: "[MAIN]", "bargo starting as {}", config.mode);

	let cipher = Arc::new(AesGcmCipher::new(config.key.as_bytes()));
	let config = Arc::new(config);

	let mut services: JoinSet<eyre::Result<()>> = JoinSet::new();

	// the HTTP front-end only exists on clients that asked for it
	if config.is_client() && config.client_proxy_mode != "socks5" {
		let rules = if config.client_proxy_mode == "http-auto" {
			let mut engine = RuleEngine::init().await?;
			engine.add_rules(RuleKind::White, &config.client_whitelist);
			engine.add_rules(RuleKind::Black, &config.client_blacklist);
			Some(Arc::new(engine))
		} else {
			None
		};
		let http = HttpService::new(config.clone(), rules);
		services.spawn(async move { http.run().await });
	}

	let udp = UdpService::new(config.clone(), cipher.clone());
	services.spawn(async move { udp.run().await });

	let tcp = TcpService::new(config.clone(), cipher.clone());
	services.spawn(async move { tcp.run().await });

	while let Some(finished) = services.join_next().await {
		match finished {
			Ok(Err(err)) => return Err(err),
			Ok(Ok(())) => {}
			Err(err) => return Err(eyre::eyre!("service task failed: {err}")),
		}
	}

	Ok(())
}
