//! Inspect-rows command implementation.

use serde::Serialize;
use smash_protocol::{DataRow, GetRowsResponse, WireMessage};
use std::path::Path;

/// Row representation for output.
#[derive(Debug, Serialize)]
pub struct RowInfo {
    /// Server version.
    pub version: u64,
    /// Row action.
    pub action: String,
    /// Record id.
    pub guid: String,
    /// Authoring participant.
    pub creator: u32,
    /// Destination table hash (hex).
    pub type_hash: String,
    /// Payload size in bytes.
    pub payload_size: usize,
}

impl From<&DataRow> for RowInfo {
    fn from(row: &DataRow) -> Self {
        Self {
            version: row.version,
            action: format!("{:?}", row.action),
            guid: row.guid.to_string(),
            creator: row.creator.0,
            type_hash: format!("{:08x}", row.type_hash),
            payload_size: row.payload_size(),
        }
    }
}

/// Runs the inspect-rows command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("{} not found", path.display()).into());
    }

    let body = std::fs::read(path)?;
    let rows = summarize(&body)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            print_text_output(&rows);
        }
    }

    Ok(())
}

fn summarize(body: &[u8]) -> Result<Vec<RowInfo>, Box<dyn std::error::Error>> {
    let response = GetRowsResponse::decode(body)?;
    Ok(response.rows.iter().map(RowInfo::from).collect())
}

fn print_text_output(rows: &[RowInfo]) {
    println!("Rows ({} total)", rows.len());
    println!("================");
    println!();

    for row in rows {
        println!(
            "[{:>10}] {:6} {} table={} client-{} payload={} bytes",
            row.version, row.action, row.guid, row.type_hash, row.creator, row.payload_size
        );
    }
}
