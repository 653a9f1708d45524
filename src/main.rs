//! RelayKV - In-Memory Key-Value Server with Replication
//!
//! Entry point: parses the command line, sets up logging and runs the server
//! until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use relaykv::config::{Cli, ServerConfig};
use relaykv::replication::Role;
use relaykv::server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn print_banner(config: &ServerConfig) {
    let role = match &config.role {
        Role::Master => "master".to_string(),
        Role::Replica(master) => format!("replica of {}", master),
    };
    println!(
        r#"
RelayKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Server started on {} ({})
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        relaykv::VERSION,
        config.bind_address(),
        role
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = ServerConfig::from(cli);

    let server = Server::bind(config.clone())
        .await
        .with_context(|| format!("could not start server on {}", config.bind_address()))?;

    print_banner(&config);
    info!(version = relaykv::VERSION, "RelayKV ready");

    server.run_until_ctrl_c().await
}
