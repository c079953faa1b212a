use super::App;
use anyhow::{Context, Result};
use colored::Colorize;
use planner_sync_core::address::LogicalPath;
use planner_sync_core::{CollectionCache, DocumentCache};
use serde_json::Value;

async fn loaded(cache: &DocumentCache) -> Result<()> {
    let mut rx = cache.watch();
    while rx.borrow_and_update().loading {
        rx.changed().await?;
    }
    Ok(())
}

pub async fn show(app: &App, raw: &str) -> Result<()> {
    let cache = DocumentCache::open(app.context(), raw.parse::<LogicalPath>()?, Value::Null);
    loaded(&cache).await?;
    match cache.value() {
        Value::Null => println!("{} {}", "missing".yellow(), raw),
        value => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}

/// Write through the cache and stay alive until the debounced flush lands.
pub async fn set(app: &App, raw: &str, value: &str) -> Result<()> {
    let value: Value = serde_json::from_str(value).context("value must be JSON")?;
    let cache = DocumentCache::open(app.context(), raw.parse::<LogicalPath>()?, Value::Null);
    loaded(&cache).await?;

    let mut rx = cache.watch();
    cache.write(value);
    while rx.borrow_and_update().locally_pending {
        rx.changed().await?;
    }
    cache.close();

    if app.identity.is_some() {
        app.persist()?;
    }
    println!("{} {}", "wrote".green(), raw);
    Ok(())
}

pub async fn list(app: &App, raw: &str, order_by: Option<&str>) -> Result<()> {
    let cache = CollectionCache::open(app.context(), raw.parse::<LogicalPath>()?, order_by);
    let mut rx = cache.watch();
    while rx.borrow_and_update().loading {
        rx.changed().await?;
    }
    let items = cache.items();
    if items.is_empty() {
        println!("{} {}", "empty".yellow(), raw);
    }
    for entry in items {
        println!("{} {}", entry.id.bold(), serde_json::to_string(&entry.to_value())?);
    }
    Ok(())
}
