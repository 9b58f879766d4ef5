//! SMB2/3 client CLI

use clap::{Parser, Subcommand};
use rust_smb_client::auth::AnonymousCredentials;
use rust_smb_client::{ClientConfig, SmbClient};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "smb-client")]
#[command(about = "Rust SMB2/3 client", long_about = None)]
struct Args {
    /// SMB server address or hostname
    #[arg(short = 'H', long)]
    host: String,

    /// Port to connect to
    #[arg(short = 'p', long, default_value = "445")]
    port: u16,

    /// Share name to connect to
    #[arg(short = 's', long, default_value = "IPC$")]
    share: String,

    /// Extra configuration as smb.client.* key=value pairs
    #[arg(short = 'o', long = "option", value_parser = parse_property)]
    options: Vec<(String, String)>,

    /// Bind extra channels when the server supports it
    #[arg(long)]
    multi_channel: bool,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect the share and report success
    Connect,

    /// Show what the tree and its session negotiated
    Info,

    /// Connect, then print client statistics
    Stats,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let properties: HashMap<String, String> = args.options.iter().cloned().collect();
    let mut config = ClientConfig::from_properties(&properties)?;
    config.port = args.port;
    if args.multi_channel {
        config.multi_channel.enabled = true;
    }

    let client = SmbClient::tcp(config, Arc::new(AnonymousCredentials));
    let unc = format!(r"\\{}\{}", args.host, args.share);
    tracing::info!("Connecting to {}:{} share {}", args.host, args.port, args.share);

    let tree = match client.connect_tree(&unc).await {
        Ok(tree) => tree,
        Err(e) => {
            client.close().await;
            return Err(e.into());
        }
    };

    match args.command {
        Commands::Connect => {
            println!("Connected to {} (tree id {})", unc, tree.tree_id());
        }
        Commands::Info => {
            println!("Share:          {}", tree.share());
            println!("Tree type:      {:?}", tree.tree_type());
            println!(
                "Service:        {}",
                tree.confirmed_service().unwrap_or_else(|| "-".to_string())
            );
            println!("Tree id:        {}", tree.tree_id());
            println!("DFS share:      {}", tree.is_dfs());
            println!("Domain DFS:     {}", tree.is_in_domain_dfs());
            println!("Share flags:    {:?}", tree.share_flags());
            if let Some(session) = tree.session() {
                let transport = session.primary_transport();
                println!("Server:         {}", transport.endpoint());
                println!("Dialect:        {:?}", transport.dialect());
                println!("Session id:     {:#x}", session.session_id());
                println!("Guest:          {}", session.is_guest());
            }
        }
        Commands::Stats => {
            println!("{}", client.statistics());
        }
    }

    tree.release();
    client.close().await;
    Ok(())
}
