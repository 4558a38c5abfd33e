#![forbid(unsafe_code)]

//! A toy three-stage pipeline exercising drylab end-to-end:
//! `SEQ_PDB@1` (a fake structure) → `SimReactor` → `RMSD_CSV@1` (synthetic
//! trajectory data) → `ReportReactor` → `REPORT_MD@1` (a summary report).
//!
//! This is demonstration wiring only — none of the reactor business logic
//! here is part of the core contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use drylab_ledger::Ledger;
use drylab_pipeline::Pipeline;
use drylab_reactor::{Reactor, ReactorError};
use drylab_schema::SchemaRegistry;
use drylab_types::{Blob, EventRow, HeaderPattern, PublishRequest, SchemaId};
use rand::Rng;

const SEQ_SCHEMA: &str = "SEQ_PDB@1";
const RMSD_SCHEMA: &str = "RMSD_CSV@1";
const REPORT_SCHEMA: &str = "REPORT_MD@1";

/// Turns a sequence event into 100 rows of synthetic RMSD-over-time data.
struct SimReactor;

#[async_trait]
impl Reactor for SimReactor {
    fn pattern(&self) -> HeaderPattern {
        HeaderPattern::for_schema(SEQ_SCHEMA)
    }

    async fn handle(&self, _row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
        let csv_bytes = generate_rmsd_csv().map_err(|e| ReactorError::Handler(e.to_string()))?;
        Ok(vec![(RMSD_SCHEMA.to_string(), csv_bytes)])
    }
}

/// Summarizes an RMSD CSV into a short markdown report.
struct ReportReactor;

#[async_trait]
impl Reactor for ReportReactor {
    fn pattern(&self) -> HeaderPattern {
        HeaderPattern::for_schema(RMSD_SCHEMA)
    }

    async fn handle(&self, row: &EventRow) -> Result<Vec<(SchemaId, Blob)>, ReactorError> {
        let mean = mean_rmsd(&row.blob).map_err(|e| ReactorError::Handler(e.to_string()))?;
        let report = format!(
            "# Folding run report\n\nmean RMSD: {mean:.3}\n(source sha: {})\n",
            row.header.id
        );
        Ok(vec![(REPORT_SCHEMA.to_string(), report.into_bytes())])
    }
}

fn generate_rmsd_csv() -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["time", "rmsd"])?;
    let mut rng = rand::thread_rng();
    for t in 0..100 {
        let rmsd: f64 = rng.gen::<f64>() * 4.0;
        writer.write_record([t.to_string(), rmsd.to_string()])?;
    }
    Ok(writer.into_inner()?)
}

fn mean_rmsd(blob: &[u8]) -> anyhow::Result<f64> {
    let mut reader = csv::Reader::from_reader(blob);
    let mut sum = 0.0;
    let mut count = 0u32;
    for record in reader.records() {
        let record = record?;
        let rmsd: f64 = record
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("missing rmsd column"))?
            .parse()?;
        sum += rmsd;
        count += 1;
    }
    if count == 0 {
        anyhow::bail!("no rows to summarize");
    }
    Ok(sum / f64::from(count))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let schema_dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("schemas");
    let registry = SchemaRegistry::new(schema_dir);
    let idle_timeout = Duration::from_millis(500);
    let ledger = Ledger::open_with_idle_timeout("demo.db", registry, idle_timeout).await?;

    let mut pipeline = Pipeline::new(ledger.clone()).with_idle_timeout(idle_timeout);
    pipeline.add(Arc::new(SimReactor), "run1");
    pipeline.add(Arc::new(ReportReactor), "run1");

    ledger
        .publish(PublishRequest::new("run1", SEQ_SCHEMA, b"FAKEPDB".to_vec()))
        .await?;

    pipeline.run_forever().await?;

    for row in ledger.replay("run1", 0).await? {
        println!("{} {}", row.header.schema, row.header.id);
    }

    Ok(())
}
