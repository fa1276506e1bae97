//! Standalone tether remoting server host.
//!
//! Binds the listening socket, serves remoting connections until a peer
//! requests shutdown (or Ctrl-C), and reports failures through the
//! documented exit codes: 0 on success, 1 when the socket cannot be
//! created, 2 when serving fails.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tether_runtime::{InstanceRegistry, RemotingServer, ServerConfig, ServiceContainer};

/// Exit code for a socket that could not be created.
const EXIT_SOCKET_FAILURE: i32 = 1;
/// Exit code for a server that failed while running.
const EXIT_START_FAILURE: i32 = 2;

/// Remoting server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Hosts remotable objects for tether clients")]
struct Args {
	/// Port to listen on
	#[arg(short, long, default_value = "4600")]
	port: u16,

	/// Verbose logging
	#[arg(short, long)]
	verbose: bool,

	/// Append logs to this file instead of stderr
	#[arg(long, value_name = "PATH")]
	log_file: Option<PathBuf>,

	/// Exit when the last client disconnects
	#[arg(long)]
	kill_on_disconnect: bool,
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
	let level = if args.verbose {
		tracing::Level::DEBUG
	} else {
		tracing::Level::INFO
	};
	let builder = tracing_subscriber::fmt().with_max_level(level);
	match &args.log_file {
		Some(path) => {
			let file = std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)?;
			builder.with_writer(Arc::new(file)).with_ansi(false).init();
		}
		None => builder.init(),
	}
	Ok(())
}

#[tokio::main]
async fn main() {
	let args = Args::parse();
	if let Err(err) = init_tracing(&args) {
		eprintln!("failed to initialise logging: {err}");
		std::process::exit(EXIT_START_FAILURE);
	}

	info!(port = args.port, "starting tether-server");

	let registry = InstanceRegistry::new();
	let container = ServiceContainer::new();
	let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
	let server = match RemotingServer::bind(
		addr,
		registry,
		container,
		ServerConfig {
			kill_on_disconnect: args.kill_on_disconnect,
		},
	)
	.await
	{
		Ok(server) => server,
		Err(err) => {
			error!(%addr, error = %err, "failed to create listening socket");
			std::process::exit(EXIT_SOCKET_FAILURE);
		}
	};

	let shutdown = server.shutdown_token();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("interrupt received, shutting down");
			shutdown.cancel();
		}
	});

	if let Err(err) = server.serve().await {
		error!(error = %err, "server failed");
		std::process::exit(EXIT_START_FAILURE);
	}
}
