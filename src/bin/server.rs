//! slotsocks server binary
//!
//! Usage: slotsocks-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -g, --generate       Print a default configuration file
//!   --defaults           Run with the built-in configuration
//!   -h, --help           Print help information

use std::env;

use slotsocks::server::{Server, ServerConfig, ServerConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            let config = load_config(&args[2])?;
            run_server(config).await?;
        }
        "--defaults" => {
            run_server(ServerConfig::default()).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"slotsocks - fixed-slot SOCKS5 proxy

USAGE:
    slotsocks-server [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Print a default configuration file
    --defaults              Run with the built-in configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration:
        slotsocks-server --generate > slotsocks.toml

    Run the server:
        slotsocks-server --config slotsocks.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config_file = ServerConfigFile::from_config(&ServerConfig::default());

    println!("# slotsocks Server Configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", config_file.to_toml()?);

    Ok(())
}

fn load_config(config_path: &str) -> anyhow::Result<ServerConfig> {
    let content = std::fs::read_to_string(config_path)?;
    let config = ServerConfigFile::from_toml(&content)?.to_config()?;
    Ok(config)
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    tracing::info!(
        "Starting slotsocks on {}:{}",
        config.listen_addr,
        config.listen_port
    );
    tracing::info!(
        "Slots: {}, buffers: {}/{} bytes",
        config.max_sessions,
        config.inbound_buffer_size,
        config.outbound_buffer_size
    );

    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            server.shutdown();
        }
    }

    print!("{}", server.metrics().format_report());

    Ok(())
}
