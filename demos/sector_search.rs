//! Searches a previously built index for companies in a free-text sector.
//!
//! ```bash
//! OPENAI_API_KEY="sk-..." \
//! cargo run --example sector_search -- "semiconductor manufacturers" 10
//! ```

use std::env;
use std::sync::Arc;

use tracing_subscriber::FmtSubscriber;

use sector_index::{
    IndexConfig, IndexError, OpenAiEmbedder, QueryOptions, SectorQueryService, SqliteVectorIndex,
    VectorIndex,
};

#[tokio::main]
async fn main() -> Result<(), IndexError> {
    init_tracing();

    let mut args = env::args().skip(1);
    let sector = args
        .next()
        .unwrap_or_else(|| "software and cloud services".to_string());
    let top_k: usize = args.next().and_then(|raw| raw.parse().ok()).unwrap_or(10);

    let config = IndexConfig::from_env();
    let embedder = Arc::new(OpenAiEmbedder::new(&config)?);
    let store = Arc::new(SqliteVectorIndex::open(&config.db_path, config.dimensions).await?);
    if !store.exists().await? {
        println!("no built index at {}; run build_index first", config.db_path.display());
        return Ok(());
    }

    let service = SectorQueryService::connect(embedder, store, QueryOptions::from_config(&config))
        .await?;
    let matches = service.find_entities(&sector, top_k).await?;

    if matches.is_empty() {
        println!("no companies matched '{sector}'");
        return Ok(());
    }
    println!("top matches for '{sector}':");
    for (rank, m) in matches.iter().enumerate() {
        let name = m.metadata["entity_name"].as_str().unwrap_or("?");
        println!("{:>3}. {:<8} {:.3}  {name}", rank + 1, m.entity_id, m.score);
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
