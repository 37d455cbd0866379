//! # Tessera CLI Module
//!
//! Command-line interface for administering Tessera graphs.
//!
//! ## Available Commands
//!
//! - `init` - Create a graph and declare its schema
//! - `status` - Show graph counters
//! - `transact` - Apply a batch of operations from a JSON file
//! - `query` - List datoms matching a pattern
//! - `validate` - Check the graph against its schema
//! - `rebuild` - Rebuild the indexes from stored blocks
//! - `export` - Export the graph (canonical or JSON)
//! - `import` - Create a graph from a canonical export
//! - `unlink` - Delete a graph's storage
//! - `hash` - Compute the BLAKE3 hash of the canonical export

mod commands;

use crate::config::TesseraConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tessera_core::{SessionManager, TesseraError};

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Tessera - durable fact store
///
/// Graphs of (entity, attribute, value, tx) facts in persistent B+tree
/// indexes, with migrations and automatic index recovery.
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to tessera.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the graph files (overrides the config file)
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Graph to operate on
    #[arg(short, long, global = true, default_value = "default")]
    pub graph: String,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the graph, optionally declaring a schema
    Init {
        /// JSON schema file: { "attribute": { "value_type": ..., ... } }
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },

    /// Show graph status
    Status,

    /// Apply a JSON array of operations as one transaction
    Transact {
        /// Path to the operations file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List datoms matching a pattern
    Query {
        /// Entity id
        #[arg(short, long)]
        entity: Option<u64>,

        /// Attribute name
        #[arg(short, long)]
        attribute: Option<String>,

        /// Value as JSON, e.g. '{"str":"A"}' or '{"long":5}'
        #[arg(long)]
        value: Option<String>,
    },

    /// Check every datom against the schema and the indexes against each other
    Validate,

    /// Rebuild the indexes from stored blocks after a safety export
    Rebuild {
        /// Schema to use if the stored one is unreadable
        #[arg(short, long)]
        schema: Option<PathBuf>,
    },

    /// Export the graph
    Export {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Export format (canonical, json)
        #[arg(short = 't', long, default_value = "canonical")]
        format: String,
    },

    /// Create the graph from a canonical export
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Delete the graph's storage
    Unlink,

    /// Compute BLAKE3 cryptographic hash of the canonical export
    Hash,
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub fn execute(cli: Cli, config: &TesseraConfig) -> Result<(), TesseraError> {
    let data_dir = config.data_dir(cli.data_dir.as_deref());
    let manager = SessionManager::new(config.session_config(&data_dir));
    let ctx = CommandContext {
        manager: &manager,
        graph: &cli.graph,
        json_mode: cli.json,
    };

    let result = match cli.command {
        Some(Commands::Init { schema }) => cmd_init(&ctx, schema.as_deref()),
        Some(Commands::Status) | None => cmd_status(&ctx),
        Some(Commands::Transact { file }) => cmd_transact(&ctx, &file),
        Some(Commands::Query {
            entity,
            attribute,
            value,
        }) => cmd_query(&ctx, entity, attribute, value.as_deref()),
        Some(Commands::Validate) => cmd_validate(&ctx),
        Some(Commands::Rebuild { schema }) => cmd_rebuild(&ctx, schema.as_deref()),
        Some(Commands::Export { output, format }) => cmd_export(&ctx, &output, &format),
        Some(Commands::Import { input }) => cmd_import(&ctx, &input),
        Some(Commands::Unlink) => cmd_unlink(&ctx),
        Some(Commands::Hash) => cmd_hash(&ctx),
    };

    let closed = manager.close_all();
    result.and(closed)
}
