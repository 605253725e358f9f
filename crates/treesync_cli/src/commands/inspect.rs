//! Inspect command implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use treesync_engine::Journal;
use treesync_protocol::{
    Exchange, FailureKind, RecordState, Transmission, TransmissionResponse, TransmissionState,
};
use uuid::Uuid;

/// Summary of one journal file.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Summary {
    /// A transmission.
    Transmission(TransmissionSummary),
    /// A response.
    Response(ResponseSummary),
}

/// Summary of a transmission.
#[derive(Debug, Serialize)]
pub struct TransmissionSummary {
    /// Transmission uuid.
    pub uuid: Uuid,
    /// Sending server.
    pub source: Uuid,
    /// Receiving server.
    pub target: Option<Uuid>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Whether a reverse transmission was requested.
    pub requesting_reciprocal: bool,
    /// Whether a stopped record held everything back.
    pub max_retry_reached: bool,
    /// Number of confirmed records carried.
    pub confirmations: usize,
    /// Records, in order.
    pub records: Vec<RecordSummary>,
}

/// Summary of one change record.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Record uuid.
    pub uuid: Uuid,
    /// State when packaged.
    pub state: RecordState,
    /// Retry count when packaged.
    pub retry_count: u32,
    /// Contained entity types.
    pub types: Vec<String>,
    /// Number of items.
    pub items: usize,
}

/// Summary of a response.
#[derive(Debug, Serialize)]
pub struct ResponseSummary {
    /// Uuid of the answered transmission.
    pub uuid: Uuid,
    /// Responding server.
    pub source: Uuid,
    /// Server the response went back to.
    pub target: Option<Uuid>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Overall outcome.
    pub state: TransmissionState,
    /// Outcomes, in order.
    pub imports: Vec<ImportSummary>,
    /// Embedded reverse transmission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded: Option<TransmissionSummary>,
}

/// Summary of one import outcome.
#[derive(Debug, Serialize)]
pub struct ImportSummary {
    /// Ingested record.
    pub record: Uuid,
    /// Outcome.
    pub state: RecordState,
    /// Failure classification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Transmission> for TransmissionSummary {
    fn from(tx: &Transmission) -> Self {
        Self {
            uuid: tx.uuid,
            source: tx.source,
            target: tx.target,
            timestamp: tx.timestamp,
            requesting_reciprocal: tx.requesting_reciprocal,
            max_retry_reached: tx.max_retry_reached,
            confirmations: tx.confirmed_records.len(),
            records: tx
                .records
                .iter()
                .map(|r| RecordSummary {
                    uuid: r.uuid,
                    state: r.state,
                    retry_count: r.retry_count,
                    types: r.contained_classes.iter().cloned().collect(),
                    items: r.items().len(),
                })
                .collect(),
        }
    }
}

impl From<&TransmissionResponse> for ResponseSummary {
    fn from(response: &TransmissionResponse) -> Self {
        Self {
            uuid: response.uuid,
            source: response.source,
            target: response.target,
            timestamp: response.timestamp,
            state: response.state,
            imports: response
                .import_records
                .iter()
                .map(|i| ImportSummary {
                    record: i.source_record_uuid,
                    state: i.state,
                    error_kind: i.error_kind,
                    error: i.error_message.clone(),
                })
                .collect(),
            embedded: response.embedded.as_deref().map(TransmissionSummary::from),
        }
    }
}

impl From<&Exchange> for Summary {
    fn from(exchange: &Exchange) -> Self {
        match exchange {
            Exchange::Transmission(tx) => Summary::Transmission(tx.into()),
            Exchange::Response(response) => Summary::Response(response.into()),
        }
    }
}

/// Runs the inspect command.
pub fn run(file: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !file.exists() {
        return Err(format!("No journal file at {:?}", file).into());
    }
    let exchange = Journal::read(file)?;
    let summary = Summary::from(&exchange);
    tracing::debug!(file = %file.display(), "decoded journal file");

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => {
            print!("{}", render_text(&summary));
        }
    }

    Ok(())
}

fn render_text(summary: &Summary) -> String {
    let mut out = String::new();
    match summary {
        Summary::Transmission(tx) => {
            out.push_str("Transmission\n============\n\n");
            render_transmission(&mut out, tx, "");
        }
        Summary::Response(response) => {
            out.push_str("Response\n========\n\n");
            out.push_str(&format!("UUID:      {}\n", response.uuid));
            out.push_str(&format!("Source:    {}\n", response.source));
            out.push_str(&format!("Target:    {}\n", display_target(response.target)));
            out.push_str(&format!("Timestamp: {}\n", response.timestamp));
            out.push_str(&format!("State:     {}\n", response.state));
            out.push_str(&format!("\nImports ({}):\n", response.imports.len()));
            for import in &response.imports {
                out.push_str(&format!("  {} {}", import.record, import.state));
                if let Some(error) = &import.error {
                    let kind = import
                        .error_kind
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "error".to_string());
                    out.push_str(&format!(" [{kind}] {error}"));
                }
                out.push('\n');
            }
            if let Some(embedded) = &response.embedded {
                out.push_str("\nEmbedded transmission:\n");
                render_transmission(&mut out, embedded, "  ");
            }
        }
    }
    out
}

fn render_transmission(out: &mut String, tx: &TransmissionSummary, indent: &str) {
    out.push_str(&format!("{indent}UUID:      {}\n", tx.uuid));
    out.push_str(&format!("{indent}Source:    {}\n", tx.source));
    out.push_str(&format!("{indent}Target:    {}\n", display_target(tx.target)));
    out.push_str(&format!("{indent}Timestamp: {}\n", tx.timestamp));
    if tx.requesting_reciprocal {
        out.push_str(&format!("{indent}Requesting reciprocal transmission\n"));
    }
    if tx.max_retry_reached {
        out.push_str(&format!("{indent}Max retry reached\n"));
    }
    out.push_str(&format!("{indent}Confirmations: {}\n", tx.confirmations));
    out.push_str(&format!("\n{indent}Records ({}):\n", tx.records.len()));
    for record in &tx.records {
        out.push_str(&format!(
            "{indent}  {} {} retry={} items={} [{}]\n",
            record.uuid,
            record.state,
            record.retry_count,
            record.items,
            record.types.join(", ")
        ));
    }
}

fn display_target(target: Option<Uuid>) -> String {
    target.map_or_else(|| "-".to_string(), |t| t.to_string())
}
