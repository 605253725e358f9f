//! List command implementation.

use serde::Serialize;
use std::path::Path;
use treesync_engine::Journal;
use treesync_protocol::Exchange;

/// One journal file.
#[derive(Debug, Serialize)]
pub struct JournalEntry {
    /// File name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// "transmission", "response", or "unreadable".
    pub kind: &'static str,
    /// Records carried, for transmissions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
}

/// Runs the list command.
pub fn run(dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("No journal directory at {:?}", dir).into());
    }
    let entries = collect(dir)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            println!("{} journal files in {}", entries.len(), dir.display());
            for entry in &entries {
                match entry.records {
                    Some(records) => println!(
                        "  {:<48} {:>8} bytes  {} ({} records)",
                        entry.name, entry.size, entry.kind, records
                    ),
                    None => println!("  {:<48} {:>8} bytes  {}", entry.name, entry.size, entry.kind),
                }
            }
        }
    }

    Ok(())
}

fn collect(dir: &Path) -> Result<Vec<JournalEntry>, Box<dyn std::error::Error>> {
    let mut entries = Vec::new();
    for path in Journal::list(dir)? {
        let size = std::fs::metadata(&path)?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (kind, records) = match Journal::read(&path) {
            Ok(Exchange::Transmission(tx)) => ("transmission", Some(tx.records.len())),
            Ok(Exchange::Response(_)) => ("response", None),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "cannot decode journal file");
                ("unreadable", None)
            }
        };
        entries.push(JournalEntry {
            name,
            size,
            kind,
            records,
        });
    }
    Ok(entries)
}
