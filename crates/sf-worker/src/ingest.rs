//! Fetch new source items and store the ones worth reviewing.

use serde::Serialize;

use sf_core::config::FetchConfig;
use sf_core::events::{EventBus, EventPayload};
use sf_core::Result;
use sf_db::models::NewSourceItem;
use sf_db::queries::source_items;
use sf_db::DbPool;
use sf_pipeline::{FetchQuery, FetchedItem, Fetcher};

/// Outcome of one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    pub inserted: usize,
    /// Already stored under the same `(source, external_id)`.
    pub duplicates: usize,
    /// Outside the configured length bounds, or empty.
    pub filtered: usize,
}

fn acceptable(item: &FetchedItem, config: &FetchConfig) -> bool {
    if item.title.trim().is_empty() || item.body.trim().is_empty() {
        return false;
    }
    let chars = item.body.chars().count();
    chars >= config.min_chars as usize && chars <= config.max_chars as usize
}

/// Run the fetcher once and insert new items as `pending`.
///
/// Fetching is best-effort: whatever the fetcher returns is used. Only a
/// store failure is an error.
pub async fn ingest(
    db: &DbPool,
    event_bus: &EventBus,
    fetcher: &dyn Fetcher,
    config: &FetchConfig,
) -> Result<IngestReport> {
    let query = FetchQuery {
        sources: config.sources.clone(),
        limit: config.limit as usize,
    };
    let fetched = fetcher.fetch(&query).await;

    let mut report = IngestReport {
        fetched: fetched.len(),
        ..Default::default()
    };

    let conn = sf_db::get_conn(db)?;
    for item in fetched {
        if !acceptable(&item, config) {
            tracing::debug!(source = %item.source, external_id = %item.external_id, "Skipping item outside length bounds");
            report.filtered += 1;
            continue;
        }

        let new = NewSourceItem {
            source: item.source,
            external_id: item.external_id,
            title: item.title,
            body: item.body,
        };
        match source_items::insert_if_new(&conn, &new)? {
            Some(stored) => {
                tracing::info!(item_id = %stored.id, source = %stored.source, title = %stored.title, "Ingested item");
                report.inserted += 1;
            }
            None => report.duplicates += 1,
        }
    }

    tracing::info!(
        fetched = report.fetched,
        inserted = report.inserted,
        duplicates = report.duplicates,
        filtered = report.filtered,
        "Ingest finished"
    );
    if report.inserted > 0 {
        event_bus.publish(EventPayload::ItemsIngested {
            count: report.inserted as u64,
        });
    }
    Ok(report)
}
