use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{CraError, Result};

use super::types::{ANY_VERSION, MetadataRow, NEW_ROW};

/// Per-row metadata store with optimistic versioning.
///
/// No multi-row transactions are offered; every call touches one row or
/// reads a snapshot of all rows.
#[async_trait]
pub trait RowStore<R: MetadataRow>: Send + Sync {
    /// Write `row`, succeeding iff `expected_version` is [`ANY_VERSION`], is
    /// [`NEW_ROW`] and no row exists, or equals the stored version. Returns the
    /// row as stored, carrying its new version.
    async fn insert_or_replace(&self, row: R, expected_version: &str) -> Result<R>;

    /// Remove the row with the same key. Removing an absent row is not an error.
    async fn delete(&self, row: &R) -> Result<()>;

    async fn get_all(&self) -> Result<Vec<R>>;

    /// Drop every row of this kind.
    async fn delete_store(&self) -> Result<()>;

    async fn get_all_matching(
        &self,
        predicate: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Vec<R>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|row| predicate(row))
            .collect())
    }

    /// Zero-or-one lookup; `Ok(None)` is the normal "absent" outcome.
    async fn get(
        &self,
        predicate: &(dyn for<'r> Fn(&'r R) -> bool + Send + Sync),
    ) -> Result<Option<R>> {
        Ok(self.get_all_matching(predicate).await?.into_iter().next())
    }

    async fn get_by_key(&self, key: &[String]) -> Result<Option<R>> {
        let key = key.to_vec();
        self.get(&move |row: &R| row.key() == key).await
    }
}

/// Apply a versioned upsert to an in-memory row set.
pub(crate) fn apply_upsert<R: MetadataRow>(
    rows: &mut Vec<R>,
    mut row: R,
    expected_version: &str,
) -> Result<R> {
    let key = row.key();
    let position = rows.iter().position(|existing| existing.key() == key);
    let current = position.map(|idx| rows[idx].version_id().to_string());

    let accepted = match (&current, expected_version) {
        (_, ANY_VERSION) => true,
        (None, NEW_ROW) => true,
        (Some(stored), expected) => stored.as_str() == expected,
        (None, _) => false,
    };
    if !accepted {
        return Err(CraError::VersionConflict {
            kind: R::KIND,
            key: key.join("."),
            expected: expected_version.to_string(),
            actual: current.unwrap_or_else(|| "<absent>".to_string()),
        });
    }

    let next = current
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(1, |v| v + 1);
    row.set_version_id(next.to_string());
    match position {
        Some(idx) => rows[idx] = row.clone(),
        None => rows.push(row.clone()),
    }
    Ok(row)
}

pub(crate) fn apply_delete<R: MetadataRow>(rows: &mut Vec<R>, row: &R) {
    let key = row.key();
    rows.retain(|existing| existing.key() != key);
}

/// Read-modify-write of one row. A version conflict triggers one fresh
/// re-read and reapply; a second conflict is returned to the caller.
///
/// Returns `Ok(None)` if the row does not exist.
pub async fn update_with_retry<R, F>(
    store: &dyn RowStore<R>,
    key: &[String],
    mut apply: F,
) -> Result<Option<R>>
where
    R: MetadataRow,
    F: FnMut(&mut R) + Send,
{
    let mut attempts = 0;
    loop {
        let Some(mut row) = store.get_by_key(key).await? else {
            return Ok(None);
        };
        let version = row.version_id().to_string();
        apply(&mut row);
        match store.insert_or_replace(row, &version).await {
            Ok(stored) => return Ok(Some(stored)),
            Err(CraError::VersionConflict { .. }) if attempts == 0 => {
                attempts += 1;
                tracing::debug!("retrying {} update after version conflict", R::KIND);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Row store kept in process memory, for tests and single-process clusters.
pub struct MemoryRowStore<R> {
    rows: RwLock<Vec<R>>,
}

impl<R> Default for MemoryRowStore<R> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }
}

impl<R> MemoryRowStore<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<R: MetadataRow> RowStore<R> for MemoryRowStore<R> {
    async fn insert_or_replace(&self, row: R, expected_version: &str) -> Result<R> {
        let mut rows = self.rows.write().expect("rows poisoned");
        apply_upsert(&mut rows, row, expected_version)
    }

    async fn delete(&self, row: &R) -> Result<()> {
        let mut rows = self.rows.write().expect("rows poisoned");
        apply_delete(&mut rows, row);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<R>> {
        Ok(self.rows.read().expect("rows poisoned").clone())
    }

    async fn delete_store(&self) -> Result<()> {
        self.rows.write().expect("rows poisoned").clear();
        Ok(())
    }
}
