//! # Tessera - Durable Fact Store
//!
//! The administrative binary for tessera-core graphs.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │          apps/tessera (THE BINARY)          │
//! │                                             │
//! │   ┌─────────────┐      ┌────────────────┐   │
//! │   │    CLI      │      │ tessera.toml   │   │
//! │   │   (clap)    │      │    (toml)      │   │
//! │   └──────┬──────┘      └───────┬────────┘   │
//! │          └───────────┬─────────┘            │
//! │                      ▼                      │
//! │              ┌───────────────┐              │
//! │              │ tessera-core  │              │
//! │              │  (THE STORE)  │              │
//! │              └───────────────┘              │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! tessera init -g people --schema schema.json
//! tessera transact -g people -f ops.json
//! tessera query -g people -a person/name --json
//! tessera rebuild -g people
//! ```

use clap::Parser;
use tessera::cli::{self, Cli};
use tessera::config::{LogFormat, TesseraConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

fn main() {
    let cli = Cli::parse();

    let config = TesseraConfig::load(cli.config.as_deref());
    let log_format = std::env::var("TESSERA_LOG_FORMAT").map_or_else(
        |_| {
            config
                .as_ref()
                .map_or(LogFormat::Text, |c| c.log_format)
        },
        |v| LogFormat::from_env_value(&v),
    );
    init_tracing(log_format, cli.verbose, cli.quiet);

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = cli::execute(cli, &config) {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the flags.
fn init_tracing(format: LogFormat, verbose: bool, quiet: bool) {
    let default_filter = if quiet {
        "tessera=error,tessera_core=error"
    } else if verbose {
        "tessera=debug,tessera_core=debug"
    } else {
        "tessera=info,tessera_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
