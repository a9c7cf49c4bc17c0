use clap::{Parser, Subcommand};
use tracing::info;

use rcl_core::config::{DriverKind, RclConfig, ServerEndpoint};

#[derive(Parser)]
#[command(name = "rcl")]
#[command(about = "RCL - Remote compute devices over the network")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the RCL server (exposes local compute devices over the network)
    Server {
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Node identifier carried by every handle this server issues
        #[arg(long)]
        server_id: Option<u16>,

        /// Native driver: auto, opencl or host
        #[arg(long)]
        driver: Option<String>,

        /// TLS certificate file (PEM)
        #[arg(long)]
        cert: Option<String>,

        /// TLS private key file (PEM)
        #[arg(long)]
        key: Option<String>,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,

        /// Write PID to this file (for service managers)
        #[arg(long)]
        pid_file: Option<String>,
    },

    /// Generate an authentication token
    Token {
        /// Name for this token/client
        #[arg(short, long, default_value = "client")]
        name: String,
    },

    /// Show the devices a server exposes
    Info {
        /// Server address to query (host:port)
        #[arg(short, long)]
        server: String,

        /// Authentication token
        #[arg(short, long, default_value = "")]
        token: String,

        /// Connect over TLS
        #[arg(long)]
        tls: bool,

        /// CA certificate for a self-signed server (PEM)
        #[arg(long)]
        ca_cert: Option<String>,
    },
}

fn parse_driver(name: &str) -> anyhow::Result<DriverKind> {
    match name {
        "auto" => Ok(DriverKind::Auto),
        "opencl" => Ok(DriverKind::OpenCl),
        "host" => Ok(DriverKind::Host),
        other => anyhow::bail!("unknown driver '{}' (expected auto, opencl or host)", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rcl_common::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            server_id,
            driver,
            cert,
            key,
            config,
            pid_file,
        } => {
            let config_path = config.unwrap_or_else(rcl_core::config::default_config_path);
            let rcl_config = RclConfig::load_or_default(&config_path);

            let mut server_config = rcl_config.server;
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(bind) = bind {
                server_config.bind = bind;
            }
            if let Some(id) = server_id {
                server_config.server_id = id;
            }
            if let Some(ref name) = driver {
                server_config.driver = parse_driver(name)?;
            }
            if cert.is_some() {
                server_config.cert_path = cert;
            }
            if key.is_some() {
                server_config.key_path = key;
            }

            if let Some(ref path) = pid_file {
                std::fs::write(path, std::process::id().to_string())?;
            }

            info!(
                "starting RCL server {} on {}:{} (config: {})",
                server_config.server_id, server_config.bind, server_config.port, config_path
            );

            let result = match rcl_server::RclServer::new(server_config, rcl_config.security.tokens) {
                Ok(server) => server.run().await.map_err(|e| anyhow::anyhow!("{}", e)),
                Err(e) => Err(anyhow::anyhow!("failed to start server: {}", e)),
            };

            if let Some(ref path) = pid_file {
                let _ = std::fs::remove_file(path);
            }

            result?;
        }

        Commands::Token { name } => {
            let token = rcl_transport::auth::generate_token(32);
            println!("Generated RCL token for '{}':", name);
            println!();
            println!("  {}", token);
            println!();
            println!("Add this to your server's rcl.toml:");
            println!();
            println!("  [[security.tokens]]");
            println!("  token = \"{}\"", token);
            println!("  name = \"{}\"", name);
            println!();
            println!("And to your client's rcl.toml or --token flag:");
            println!();
            println!("  [[client.servers]]");
            println!("  address = \"<server-ip>:9777\"");
            println!("  token = \"{}\"", token);
        }

        Commands::Info {
            server,
            token,
            tls,
            ca_cert,
        } => {
            info!("querying devices from {}", server);

            let endpoint = ServerEndpoint {
                tls,
                ca_cert,
                ..ServerEndpoint::plain(server.clone(), token)
            };
            let client = match rcl_client::Client::connect(&endpoint).await {
                Ok(client) => client,
                Err(rcl_client::ClientError::AuthFailed(msg)) => {
                    eprintln!("Authentication failed: {}", msg);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            println!(
                "Connected to RCL server {} at {} (session {})",
                client.server_id(),
                server,
                client.session_id()
            );
            println!("Available devices:");
            println!();
            for device in client.devices() {
                println!("  Device {}: {}", device.server_device_index, device.device_name);
                println!("    Vendor:   {}", device.vendor);
                println!("    Version:  {}", device.version);
                println!("    Type:     {:?}", device.device_type);
                println!("    Memory:   {} MB", device.global_mem_size / (1024 * 1024));
                println!("    Fill:     {}", device.supports_fill);
                println!(
                    "    Queue:    {}{}",
                    if device.out_of_order { "out-of-order" } else { "in-order" },
                    if device.profiling { ", profiling" } else { "" }
                );
                println!();
            }
        }
    }

    Ok(())
}
