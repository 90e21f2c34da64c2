//! Tunelay - a client/server VPN tunnel

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tunelay::access::{AccessToken, FileAccessManager};
use tunelay::client::ClientSession;
use tunelay::config::{ClientConfig, ServerConfig};
use tunelay::crypto::{random_key, sha256};
use tunelay::device::{InMemoryTunAdapter, SystemSocketFactory};
use tunelay::error::Result;
use tunelay::server::{TlsIdentity, TunnelServer};
use tunelay::{ClientState, IpPacket};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if let Some(config_type) = args.gen_config {
        let json = match config_type.as_str() {
            "client" => {
                let config = ClientConfig {
                    token: sample_token(),
                    options: Default::default(),
                };
                serde_json::to_string_pretty(&config).unwrap()
            }
            "server" => serde_json::to_string_pretty(&ServerConfig::default()).unwrap(),
            _ => {
                eprintln!("Unknown config type: {}. Use 'client' or 'server'", config_type);
                std::process::exit(1);
            }
        };
        println!("{}", json);
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Tunelay v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    match args.command.as_deref() {
        Some("server") => {
            let config = load_server_config(&args)?;
            rt.block_on(run_server(config))
        }
        Some("client") => {
            let config = load_client_config(&args)?;
            rt.block_on(run_client_check(config))
        }
        Some("gen-token") => rt.block_on(gen_token(&args)),
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn load_server_config(args: &Args) -> Result<ServerConfig> {
    match &args.config {
        Some(path) => ServerConfig::load(path),
        None => {
            info!("No config file specified, using default server config");
            Ok(ServerConfig::default())
        }
    }
}

fn load_client_config(args: &Args) -> Result<ClientConfig> {
    let path = args.config.as_ref().ok_or_else(|| {
        tunelay::Error::Config("client mode needs a config file (-c client.json)".into())
    })?;
    ClientConfig::load(path)
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let options = config.options;
    let identity = match (&options.certificate_file, &options.key_file) {
        (Some(cert), Some(key)) => TlsIdentity::load(cert, key)?,
        _ => {
            return Err(tunelay::Error::Config(
                "server needs certificate_file and key_file".into(),
            ))
        }
    };
    if let Some(hash) = identity.certificate_hash() {
        use base64::Engine;
        info!(
            "certificate hash (pin this in tokens): {}",
            base64::engine::general_purpose::STANDARD.encode(hash)
        );
    }

    let access = Arc::new(FileAccessManager::new(&options.storage_dir)?);
    let server = TunnelServer::new(
        options,
        identity,
        access,
        Arc::new(SystemSocketFactory),
        None,
    )?;
    server.run().await
}

/// Client connectivity check: connect, ping the tunnel gateway through an
/// in-memory adapter, print the status. Platform front-ends embed the
/// library with a real TUN adapter instead.
async fn run_client_check(config: ClientConfig) -> Result<()> {
    let device = InMemoryTunAdapter::new("tunelay-check", 1420, false);
    let session = ClientSession::new(
        config.token,
        config.options,
        device.clone(),
        Arc::new(SystemSocketFactory),
    );
    session.connect().await?;

    let info = session
        .session_info()
        .ok_or_else(|| tunelay::Error::Disposed)?;
    info!(
        "connected: session {} virtual {}",
        info.session_id, info.virtual_ip_v4
    );

    // Ping the gateway (first host of the virtual network) via the tunnel
    let gateway = {
        let mut octets = info.virtual_ip_v4.octets();
        octets[3] = 1;
        std::net::Ipv4Addr::from(octets)
    };
    let ping = IpPacket::build_icmp_echo_v4(info.virtual_ip_v4, gateway, 7, 1, b"tunelay check")?;
    device.inject(ping);

    let reply = tokio::time::timeout(std::time::Duration::from_secs(2), device.next_outbound())
        .await
        .map_err(|_| tunelay::Error::RequestTimeout)?;
    match reply {
        Some(packet) if packet.is_icmp_echo_reply() => info!("gateway ping ok"),
        _ => info!("no echo reply from the gateway"),
    }

    let status = session.session_status().await?;
    info!(
        "status: {} / speed {} / channels {} (udp: {})",
        status.traffic, status.speed, status.channel_count, status.is_udp_mode
    );

    session.shutdown().await;
    if session.wait_for_state(ClientState::Disposed, std::time::Duration::from_secs(5)).await {
        info!("Goodbye!");
    }
    Ok(())
}

async fn gen_token(args: &Args) -> Result<()> {
    let storage = args
        .storage
        .clone()
        .unwrap_or_else(|| PathBuf::from("./tokens"));
    let manager = FileAccessManager::new(&storage)?;

    let certificate_hash = match &args.cert {
        Some(path) => {
            let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
                std::fs::File::open(path)
                    .map_err(|e| tunelay::Error::Config(format!("cannot open {}: {}", path, e)))?,
            ))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| tunelay::Error::Config(format!("cannot parse {}: {}", path, e)))?;
            certs.first().map(|c| sha256(c.as_ref()))
        }
        None => None,
    };

    let token = AccessToken {
        token_id: uuid::Uuid::new_v4().simple().to_string(),
        secret: random_key(),
        expiration: None,
        max_traffic: None,
        max_client_count: args.max_clients,
        ad_requirement: Default::default(),
        name: args.name.clone(),
        endpoints: args.endpoints.clone(),
        host_name: args.host_name.clone().unwrap_or_else(|| "localhost".into()),
        certificate_hash,
    };
    let token = manager.create_token(token).await?;
    println!("{}", serde_json::to_string_pretty(&token).unwrap());
    Ok(())
}

fn sample_token() -> AccessToken {
    AccessToken {
        token_id: "replace-me".into(),
        secret: random_key(),
        expiration: None,
        max_traffic: None,
        max_client_count: None,
        ad_requirement: Default::default(),
        name: Some("example".into()),
        endpoints: vec!["127.0.0.1:9443".parse().unwrap()],
        host_name: "vpn.example.com".into(),
        certificate_hash: None,
    }
}

/// Command line arguments
struct Args {
    command: Option<String>,
    config: Option<PathBuf>,
    gen_config: Option<String>,
    storage: Option<PathBuf>,
    name: Option<String>,
    host_name: Option<String>,
    cert: Option<String>,
    endpoints: Vec<SocketAddr>,
    max_clients: Option<u32>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut command = None;
        let mut config = None;
        let mut gen_config = None;
        let mut storage = None;
        let mut name = None;
        let mut host_name = None;
        let mut cert = None;
        let mut endpoints = Vec::new();
        let mut max_clients = None;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--gen-config" => {
                    if i + 1 < args.len() {
                        gen_config = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--storage" => {
                    if i + 1 < args.len() {
                        storage = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--name" => {
                    if i + 1 < args.len() {
                        name = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--host-name" => {
                    if i + 1 < args.len() {
                        host_name = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--cert" => {
                    if i + 1 < args.len() {
                        cert = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--endpoint" => {
                    if i + 1 < args.len() {
                        if let Ok(endpoint) = args[i + 1].parse() {
                            endpoints.push(endpoint);
                        }
                        i += 1;
                    }
                }
                "--max-clients" => {
                    if i + 1 < args.len() {
                        max_clients = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && command.is_none() => {
                    command = Some(arg.to_string());
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            command,
            config,
            gen_config,
            storage,
            name,
            host_name,
            cert,
            endpoints,
            max_clients,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Tunelay - a client/server VPN tunnel

USAGE:
    tunelay <COMMAND> [OPTIONS]

COMMANDS:
    server                  Run the tunnel server
    client                  Run a client connectivity check
    gen-token               Create an access token in the storage dir

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    --gen-config <TYPE>     Generate example config (client/server)
    --storage <DIR>         Token storage directory (gen-token)
    --name <NAME>           Human name for the token (gen-token)
    --host-name <NAME>      TLS server name for the token (gen-token)
    --cert <FILE>           Certificate PEM to pin (gen-token)
    --endpoint <ADDR>       Server endpoint, repeatable (gen-token)
    --max-clients <N>       Concurrent client cap (gen-token)
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    tunelay --gen-config server > server.json
    tunelay server -c server.json
    tunelay gen-token --storage ./tokens --host-name vpn.example.com \
        --endpoint 203.0.113.5:9443 --cert cert.pem
    tunelay client -c client.json
"#
    );
}

fn print_version() {
    println!("Tunelay v{}", env!("CARGO_PKG_VERSION"));
    println!("A client/server VPN tunnel");
}
