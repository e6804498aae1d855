use carwatch_core::PriceHistoryEntry;
use carwatch_storage::{CatalogStore, StoreResult};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

/// Append `price` to the listing's history unless it equals the latest entry.
/// Returns whether a row was written.
pub async fn record_price(store: &dyn CatalogStore, listing_id: Uuid, price: i64) -> StoreResult<bool> {
    if let Some(latest) = store.latest_price(listing_id).await? {
        if latest.price == price {
            return Ok(false);
        }
    }
    store
        .append_price(&PriceHistoryEntry {
            id: Uuid::new_v4(),
            listing_id,
            price,
            recorded_at: Utc::now(),
        })
        .await?;
    debug!(%listing_id, price, "price recorded");
    Ok(true)
}
