//! # CLI Command Implementations
//!
//! Every command opens the graph it works on and leaves it to `execute` to
//! close the session afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tessera_core::{
    CanonicalGraph, Connection, EntityId, OpenOptions, Pattern, Schema, SessionManager,
    TesseraError, TxMeta, TxOp, Value, canonical_checksum, export::canonical_crypto_hash,
};

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum size of a transaction file (64 MB).
const MAX_TX_FILE_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum size of a schema file (1 MB).
const MAX_SCHEMA_FILE_SIZE: u64 = 1024 * 1024;

/// Maximum size of an import file (500 MB).
const MAX_IMPORT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// What every command needs: the session, the graph and the output mode.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub manager: &'a SessionManager,
    pub graph: &'a str,
    pub json_mode: bool,
}

impl CommandContext<'_> {
    /// Open the graph, which must already have stored data.
    fn open_existing(&self) -> Result<Arc<Connection>, TesseraError> {
        self.require_existing()?;
        self.manager.open(self.graph, OpenOptions::new())
    }

    fn require_existing(&self) -> Result<(), TesseraError> {
        if self.manager.config().provider.exists(self.graph)? {
            Ok(())
        } else {
            Err(TesseraError::InvalidOperation(format!(
                "graph '{}' does not exist. Run `tessera init` first",
                self.graph
            )))
        }
    }
}

// =============================================================================
// FILE HELPERS
// =============================================================================

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), TesseraError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| TesseraError::StorageIo(format!("Cannot read file metadata: {e}")))?;

    if metadata.len() > max_size {
        return Err(TesseraError::InvalidOperation(format!(
            "File size {} bytes exceeds maximum allowed {max_size} bytes",
            metadata.len()
        )));
    }
    Ok(())
}

/// Resolve an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, TesseraError> {
    let canonical = path.canonicalize().map_err(|e| {
        TesseraError::StorageIo(format!("Invalid file path '{}': {e}", path.display()))
    })?;

    if !canonical.is_file() {
        return Err(TesseraError::StorageIo(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path. The parent directory must exist.
fn validate_output_path(path: &Path) -> Result<PathBuf, TesseraError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        TesseraError::StorageIo(format!(
            "Invalid output directory '{}': {e}",
            parent.display()
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(TesseraError::StorageIo(format!(
            "Output parent '{}' is not a directory",
            parent.display()
        )));
    }

    let file_name = path.file_name().ok_or_else(|| {
        TesseraError::StorageIo(format!("Output path '{}' has no file name", path.display()))
    })?;

    Ok(canonical_parent.join(file_name))
}

/// Read a bounded input file.
fn read_input(path: &Path, max_size: u64) -> Result<Vec<u8>, TesseraError> {
    let validated = validate_file_path(path)?;
    validate_file_size(&validated, max_size)?;
    std::fs::read(&validated)
        .map_err(|e| TesseraError::StorageIo(format!("Read file '{}': {e}", path.display())))
}

/// Read a JSON schema file.
fn read_schema(path: &Path) -> Result<Schema, TesseraError> {
    let data = read_input(path, MAX_SCHEMA_FILE_SIZE)?;
    serde_json::from_slice(&data)
        .map_err(|e| TesseraError::Deserialization(format!("Invalid schema file: {e}")))
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// INIT COMMAND
// =============================================================================

/// Create the graph and declare its schema.
pub fn cmd_init(ctx: &CommandContext<'_>, schema: Option<&Path>) -> Result<(), TesseraError> {
    if ctx.manager.config().provider.exists(ctx.graph)? {
        return Err(TesseraError::InvalidOperation(format!(
            "graph '{}' already exists",
            ctx.graph
        )));
    }

    let mut opts = OpenOptions::new();
    if let Some(path) = schema {
        opts = opts.with_schema(read_schema(path)?);
    }
    let conn = ctx.manager.open(ctx.graph, opts)?;
    let status = conn.status()?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "graph": status.graph_id,
            "schema_version": status.schema_version,
            "attributes": status.attributes,
        }));
        return Ok(());
    }

    println!(
        "Initialized graph '{}' (schema v{}, {} attributes)",
        status.graph_id, status.schema_version, status.attributes
    );
    Ok(())
}

// =============================================================================
// STATUS COMMAND
// =============================================================================

/// Show graph status.
pub fn cmd_status(ctx: &CommandContext<'_>) -> Result<(), TesseraError> {
    let conn = ctx.open_existing()?;
    let status = conn.status()?;

    if ctx.json_mode {
        print_json(&serde_json::to_value(&status).map_err(|e| {
            TesseraError::Serialization(e.to_string())
        })?);
        return Ok(());
    }

    println!("Tessera Graph Status");
    println!("====================");
    println!("Graph:          {}", status.graph_id);
    println!("Schema version: {}", status.schema_version);
    println!();
    println!("Attributes:     {}", status.attributes);
    println!("Datoms:         {}", status.datoms);
    println!("Max entity:     {}", status.max_eid);
    println!("Max tx:         {}", status.max_tx);
    println!("Stored blocks:  {}", status.blocks);
    println!("Cached pages:   {}", status.cached_pages);

    Ok(())
}

// =============================================================================
// TRANSACT COMMAND
// =============================================================================

/// Apply a JSON array of operations as one transaction.
pub fn cmd_transact(ctx: &CommandContext<'_>, file: &Path) -> Result<(), TesseraError> {
    let data = read_input(file, MAX_TX_FILE_SIZE)?;
    let ops: Vec<TxOp> = serde_json::from_slice(&data)
        .map_err(|e| TesseraError::Deserialization(format!("Invalid operations file: {e}")))?;

    let conn = ctx.open_existing()?;
    let report = conn.transact(ops, TxMeta::new().with("source", "cli"))?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "tx": report.tx_id.0,
            "added": report.datoms_added.len(),
            "retracted": report.datoms_retracted.len(),
            "tempids": report.tempids,
        }));
        return Ok(());
    }

    println!(
        "Transaction {}: {} added, {} retracted",
        report.tx_id,
        report.datoms_added.len(),
        report.datoms_retracted.len()
    );
    for (name, id) in &report.tempids {
        println!("  {name} -> {id}");
    }
    Ok(())
}

// =============================================================================
// QUERY COMMAND
// =============================================================================

/// Build a pattern from the command-line filters.
pub fn build_pattern(
    entity: Option<u64>,
    attribute: Option<String>,
    value: Option<&str>,
) -> Result<Pattern, TesseraError> {
    let mut pattern = Pattern::any();
    if let Some(e) = entity {
        pattern = pattern.with_entity(EntityId(e));
    }
    if let Some(a) = attribute {
        pattern = pattern.with_attribute(a.as_str());
    }
    if let Some(raw) = value {
        let v: Value = serde_json::from_str(raw)
            .map_err(|e| TesseraError::InvalidOperation(format!("Invalid value '{raw}': {e}")))?;
        pattern = pattern.with_value(v);
    }
    Ok(pattern)
}

/// List datoms matching a pattern.
pub fn cmd_query(
    ctx: &CommandContext<'_>,
    entity: Option<u64>,
    attribute: Option<String>,
    value: Option<&str>,
) -> Result<(), TesseraError> {
    let pattern = build_pattern(entity, attribute, value)?;
    let conn = ctx.open_existing()?;
    let db = conn.db();
    let datoms = db.query(&pattern).collect::<Result<Vec<_>, _>>()?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "count": datoms.len(),
            "datoms": datoms,
        }));
        return Ok(());
    }

    for datom in &datoms {
        println!("{datom}");
    }
    println!("{} datoms", datoms.len());
    Ok(())
}

// =============================================================================
// VALIDATE COMMAND
// =============================================================================

/// Validate the graph. Violations make the command fail.
pub fn cmd_validate(ctx: &CommandContext<'_>) -> Result<(), TesseraError> {
    let conn = ctx.open_existing()?;
    let report = conn.validate()?;

    if ctx.json_mode {
        print_json(
            &serde_json::to_value(&report)
                .map_err(|e| TesseraError::Serialization(e.to_string()))?,
        );
    } else {
        println!("Checked {} datoms", report.datoms_checked);
        for violation in &report.violations {
            let entity = violation
                .entity
                .map_or_else(|| "-".to_string(), |e| e.to_string());
            let attribute = violation
                .attribute
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string);
            println!(
                "  {:?} entity={entity} attribute={attribute}: {}",
                violation.kind, violation.detail
            );
        }
    }

    if report.is_valid() {
        Ok(())
    } else {
        Err(TesseraError::InvalidOperation(format!(
            "graph '{}' has {} violations",
            ctx.graph,
            report.violations.len()
        )))
    }
}

// =============================================================================
// REBUILD COMMAND
// =============================================================================

/// Rebuild the indexes from the stored blocks.
pub fn cmd_rebuild(ctx: &CommandContext<'_>, schema: Option<&Path>) -> Result<(), TesseraError> {
    let mut opts = OpenOptions::new();
    if let Some(path) = schema {
        opts = opts.with_schema(read_schema(path)?);
    }
    let (_conn, report) = ctx.manager.rebuild(ctx.graph, opts)?;

    if ctx.json_mode {
        print_json(
            &serde_json::to_value(&report)
                .map_err(|e| TesseraError::Serialization(e.to_string()))?,
        );
        return Ok(());
    }

    println!("Rebuilt graph '{}'", report.graph_id);
    println!("Backup:            {}", report.backup_location);
    println!(
        "Blocks:            {} scanned, {} skipped",
        report.scanned_blocks, report.skipped_blocks
    );
    println!(
        "Datoms:            {} recovered, {} dropped",
        report.recovered_datoms, report.dropped_datoms
    );
    println!("Transactions:      {}", report.transactions);
    println!("Schema source:     {:?}", report.schema_source);
    Ok(())
}

// =============================================================================
// EXPORT COMMAND
// =============================================================================

/// Export the graph to a file.
pub fn cmd_export(ctx: &CommandContext<'_>, output: &Path, format: &str) -> Result<(), TesseraError> {
    let validated_output = validate_output_path(output)?;
    let conn = ctx.open_existing()?;
    let db = conn.db();

    let data = match format {
        "canonical" => {
            let data = conn.export()?;
            println!("Checksum: {}", canonical_checksum(&db)?);
            data
        }
        "json" => {
            let graph = CanonicalGraph::from_db(&db)?;
            serde_json::to_vec_pretty(&graph)
                .map_err(|e| TesseraError::Serialization(e.to_string()))?
        }
        _ => {
            return Err(TesseraError::InvalidOperation(format!(
                "Unknown format: {format}. Use: canonical, json"
            )));
        }
    };

    std::fs::write(&validated_output, &data)
        .map_err(|e| TesseraError::StorageIo(format!("Write file: {e}")))?;

    println!(
        "Exported {} bytes to {}",
        data.len(),
        validated_output.display()
    );
    Ok(())
}

// =============================================================================
// IMPORT COMMAND
// =============================================================================

/// Create the graph from a canonical export.
pub fn cmd_import(ctx: &CommandContext<'_>, input: &Path) -> Result<(), TesseraError> {
    let data = read_input(input, MAX_IMPORT_FILE_SIZE)?;
    let conn = ctx.manager.import(ctx.graph, &data, OpenOptions::new())?;
    let status = conn.status()?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "graph": status.graph_id,
            "datoms": status.datoms,
            "max_tx": status.max_tx,
        }));
        return Ok(());
    }

    println!(
        "Imported graph '{}': {} datoms up to tx {}",
        status.graph_id, status.datoms, status.max_tx
    );
    Ok(())
}

// =============================================================================
// UNLINK COMMAND
// =============================================================================

/// Delete the graph's storage.
pub fn cmd_unlink(ctx: &CommandContext<'_>) -> Result<(), TesseraError> {
    ctx.require_existing()?;
    ctx.manager.unlink(ctx.graph)?;
    if !ctx.json_mode {
        println!("Unlinked graph '{}'", ctx.graph);
    } else {
        print_json(&serde_json::json!({ "unlinked": ctx.graph }));
    }
    Ok(())
}

// =============================================================================
// HASH COMMAND
// =============================================================================

/// Compute the BLAKE3 hash of the canonical export.
pub fn cmd_hash(ctx: &CommandContext<'_>) -> Result<(), TesseraError> {
    let conn = ctx.open_existing()?;
    let db = conn.db();
    let hash = canonical_crypto_hash(&db)?;

    if ctx.json_mode {
        print_json(&serde_json::json!({
            "graph": ctx.graph,
            "blake3": hash,
            "checksum": canonical_checksum(&db)?,
        }));
        return Ok(());
    }

    println!("BLAKE3: {hash}");
    Ok(())
}
