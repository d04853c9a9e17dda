//! Builds (or resumes) the sector index from the live filing registry.
//!
//! Configuration comes from the environment (a `.env` file works too):
//!
//! ```bash
//! SEC_COMPANY_NAME="Acme Research" \
//! SEC_CONTACT_EMAIL="research@acme.example" \
//! OPENAI_API_KEY="sk-..." \
//! cargo run --example build_index
//! ```

use std::sync::Arc;

use tracing_subscriber::FmtSubscriber;

use sector_index::{
    BuildOptions, EdgarSource, IndexBuilder, IndexConfig, IndexError, OpenAiEmbedder,
    ProgressEvent, SqliteVectorIndex,
};

#[tokio::main]
async fn main() -> Result<(), IndexError> {
    init_tracing();

    let config = IndexConfig::from_env();
    config.validate()?;

    let source = Arc::new(EdgarSource::new(&config)?);
    let embedder = Arc::new(OpenAiEmbedder::new(&config)?);
    let store = Arc::new(SqliteVectorIndex::open(&config.db_path, config.dimensions).await?);

    let builder = IndexBuilder::new(
        source,
        embedder,
        store,
        BuildOptions::from_config(&config),
    );

    let events = builder.ensure_ready().await?;
    while let Ok(event) = events.recv_async().await {
        match event {
            ProgressEvent::Started { candidates } => {
                println!("indexing {candidates} candidate companies");
            }
            ProgressEvent::Progress {
                processed,
                succeeded,
                failed,
                skipped,
            } => {
                println!("  {processed} processed ({succeeded} ok, {failed} failed, {skipped} skipped)");
            }
            ProgressEvent::BatchCommitted { entities, records } => {
                println!("  committed {records} records for {entities} companies");
            }
            ProgressEvent::Completed { state, summary } => {
                println!(
                    "build finished: {state} ({} candidates, {} indexed, {} records)",
                    summary.candidates, summary.succeeded, summary.records_upserted
                );
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let subscriber = FmtSubscriber::builder().with_env_filter("info").finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
