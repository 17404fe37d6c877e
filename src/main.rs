use anyhow::Result;
use clap::{Parser, Subcommand};

use lessonlab::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "lessonlab")]
#[command(version, about = "Streaming lesson code generation service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the generation service
    Serve {
        #[arg(short, long, default_value = "4317")]
        port: u16,

        /// Bind on all interfaces and allow any origin
        #[arg(long)]
        dev: bool,

        /// OpenAI-compatible endpoint base URL
        #[arg(long, env = "MODEL_BASE_URL", default_value = "https://api.openai.com/v1")]
        model_base_url: String,

        #[arg(long, env = "MODEL_API_KEY", default_value = "")]
        model_api_key: String,

        #[arg(long, env = "MODEL_NAME", default_value = "gpt-4o-mini")]
        model: String,

        /// Hard cap on stream connection lifetime, in seconds
        #[arg(long, default_value = "30")]
        stream_lifetime: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            port,
            dev,
            model_base_url,
            model_api_key,
            model,
            stream_lifetime,
        } => {
            start_server(ServerConfig {
                port,
                dev_mode: dev,
                model_base_url,
                model_api_key,
                model,
                stream_lifetime_secs: stream_lifetime,
            })
            .await
        }
    }
}
