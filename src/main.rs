use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use surok::agent::Agent;
use surok::config::{Config, ConfigSource, Environ, Normalizer, ENV_LOGLEVEL};
use surok::discovery::Discovery;
use surok::logging;
use surok::store::Store;

#[derive(Parser)]
#[command(name = "surok")]
#[command(about = "Service discovery driven configuration agent for Mesos/Marathon")]
#[command(version)]
struct Cli {
    /// Main configuration file (JSON, YAML or TOML)
    #[arg(short, long, default_value = "/etc/surok/surok.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop
    Agent {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Print the normalized configuration
    Config,
    /// Print every normalized application declaration
    Apps,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let environ = Environ::from_process();
    let level = environ.get(ENV_LOGLEVEL).unwrap_or("info").to_string();
    let handle = logging::init(&level)?;

    let normalizer = Normalizer::new(environ, logging::side_effects(Some(handle)));
    let sources = vec![ConfigSource::File(cli.config.clone())];
    let config = Config::with_sources(normalizer, &sources);

    match cli.command {
        Commands::Agent { once } => {
            info!("Loaded configuration from {}", cli.config.display());
            let discovery = Discovery::from_system()?;
            let mut agent = Agent::new(config, sources, discovery, Store::new())?;
            agent.run(once).await?;
        }
        Commands::Config => {
            println!("{}", config.dump());
        }
        Commands::Apps => {
            for (name, app) in config.discover_applications() {
                println!("# {}", name);
                println!("{}", app.dump());
            }
        }
    }

    Ok(())
}
