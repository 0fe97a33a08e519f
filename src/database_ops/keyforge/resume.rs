use tracing::info;

use super::error::SyncError;
use crate::database_ops::catalog_store::CatalogStore;

/// Page the next run starts from: the highest page already merged, or 1 on an empty store.
///
/// The boundary page is fetched again on purpose. A run that died mid-page left it partially
/// merged, and re-merging a complete page is a no-op.
pub async fn next_start_page<S>(store: &S) -> Result<u32, SyncError>
where
    S: CatalogStore + ?Sized,
{
    let max = store
        .max_page_number()
        .await
        .map_err(SyncError::storage)?;
    let start = max.unwrap_or(1).max(1);
    info!(resume_from = ?max, start, "keyforge: resume point");
    Ok(start)
}
