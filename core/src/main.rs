//! mapbatch demo executable
//!
//! Opens an in-memory environment, fires a burst of concurrent writes at it
//! and reports how they were batched.

use colored::Colorize;
use mapbatch_core::{
    EnvConfig, Environment, MemEngine, StoreError, StoreOptions, StoreResult, StringCodec,
    TxnOutcome, VersionCondition,
};
use std::sync::Arc;
use tracing_subscriber::{filter::EnvFilter, fmt};

const WRITERS: usize = 64;

#[tokio::main]
async fn main() -> StoreResult<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    print_banner();

    let config = match std::env::args().nth(1) {
        Some(path) => EnvConfig::from_file(path)?,
        None => EnvConfig::default(),
    };

    println!("Configuration:");
    println!("  Name: {}", config.name.bright_cyan());
    println!("  Map Size: {}", config.map_size.to_string().bright_cyan());
    println!(
        "  Async Transaction Order: {}",
        format!("{:?}", config.async_txn_order).bright_cyan()
    );
    println!(
        "  Commit Delay: {}",
        format!("{}ms", config.commit_delay_ms).bright_cyan()
    );

    let engine = Arc::new(MemEngine::new(
        config.map_size,
        config.region_span,
        config.max_dbs,
    )?);
    let env = Environment::open(engine, config)?;
    let store = env.open_store(StoreOptions::named("demo").with_versions(), StringCodec)?;

    // every write queued before the first commit lands in one batch
    let mut pending = Vec::with_capacity(WRITERS);
    for i in 0..WRITERS {
        pending.push(store.put_versioned(
            &format!("key-{:03}", i),
            &format!("value {}", i),
            1.0,
        )?);
    }
    let claimed = store.put_if_version(
        "key-000",
        &"claimed".to_string(),
        Some(2.0),
        VersionCondition::MustEqual(1.0),
    )?;

    let counter = store.clone();
    let counted = store.transaction_async(move |txn| {
        let store = counter.clone();
        async move {
            let count = store.range()?.count();
            txn.put(&store, "count", &count.to_string())?;
            Ok::<_, StoreError>(TxnOutcome::Commit(count))
        }
    })?;

    for write in pending {
        write.await?;
    }
    println!(
        "{} {}",
        "Conditional update applied:".bright_green(),
        claimed.await?
    );
    if let Some(count) = counted.await?.into_value() {
        println!("{} {}", "Entries seen by transaction:".bright_green(), count);
    }

    env.flush().await?;
    if let Some(entry) = store.get_entry("key-000")? {
        println!(
            "key-000 = {} (version {})",
            entry.value.bright_cyan(),
            entry.version.unwrap_or_default()
        );
    }

    let stats = env.stats();
    println!("{}", "Statistics:".bright_green());
    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("{} {}", "Failed to render stats:".bright_red(), e),
    }

    env.close().await?;
    println!("{}", "Environment closed".bright_green());
    Ok(())
}

fn print_banner() {
    let banner = r#"
    ┌┬┐┌─┐┌─┐┌┐ ┌─┐┌┬┐┌─┐┬ ┬
    │││├─┤├─┘├┴┐├─┤ │ │  ├─┤
    ┴ ┴┴ ┴┴  └─┘┴ ┴ ┴ └─┘┴ ┴
        write batching v0.1.0
    "#;

    println!("{}", banner.bright_blue());
}
