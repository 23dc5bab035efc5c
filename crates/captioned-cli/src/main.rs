mod caption;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use captioned_types::MediaKind;

#[derive(Parser)]
#[command(name = "captioned", about = "Social media caption pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Photo,
    Video,
}

impl From<KindArg> for MediaKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Photo => MediaKind::Photo,
            KindArg::Video => MediaKind::Video,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the caption server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Upload a photo or video and print generated captions
    Caption {
        /// Local media file
        path: std::path::PathBuf,

        /// Media kind (inferred from the file extension when omitted)
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,

        /// Caption server URL (overrides config)
        #[arg(long)]
        gateway: Option<String>,

        /// Run the orchestrator in this process instead of calling a server
        #[arg(long, conflicts_with = "gateway")]
        in_process: bool,
    },
    /// Check configuration
    Health,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port } => {
            let config = captioned_config::load_config()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let shutdown = CancellationToken::new();
                cancel_on_ctrl_c(shutdown.clone());
                captioned_gateway::start_gateway(config, port, shutdown).await
            })?;
        }
        Commands::Caption {
            path,
            kind,
            gateway,
            in_process,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(caption::run_caption(
                path,
                kind.map(MediaKind::from),
                gateway,
                in_process,
            ))?;
        }
        Commands::Health => {
            let config = captioned_config::load_config()?;
            println!("captioned is healthy");
            println!("  gateway: {}:{}", config.gateway.host, config.gateway.port);
            println!("  storage backend: {:?}", config.storage.backend);
            if let Some(bucket) = &config.storage.bucket {
                println!("  storage bucket: {bucket}");
            }
            println!("  model: {}", config.gemini.model);
            println!(
                "  gemini api key: {}",
                if config.gemini.api_key.is_some() { "set" } else { "missing" }
            );
            println!("  caption server: {}", config.client.gateway_url);
        }
    }

    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}
