use tracing::{debug, info};

use crate::store::{cell, CellRange, StoreError, TabularStore};

/// Where the ledger keeps ids and names. Fixed per deployment.
#[derive(Debug, Clone)]
pub struct LedgerLayout {
    pub sheet: String,
    pub id_col: u32,
    pub name_col: u32,
    pub first_row: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Filled { row: u32 },
    AlreadyFilled { row: u32, existing: String },
    NotFound,
    /// Empty id or name; nothing was read.
    Skipped,
}

/// Fills a ledger row's name cell, but only while it is empty.
///
/// Check and write are two calls, so two workers racing on the same row can
/// both see it empty. Identical names make that harmless; differing ones
/// leave whichever wrote last.
pub struct LedgerReconciler<'a> {
    store: &'a dyn TabularStore,
    layout: &'a LedgerLayout,
}

impl<'a> LedgerReconciler<'a> {
    pub fn new(store: &'a dyn TabularStore, layout: &'a LedgerLayout) -> Self {
        Self { store, layout }
    }

    pub async fn fill_if_empty(
        &self,
        record_id: &str,
        candidate: &str,
    ) -> Result<FillOutcome, StoreError> {
        let record_id = record_id.trim();
        let candidate = candidate.trim();
        if record_id.is_empty() || candidate.is_empty() {
            return Ok(FillOutcome::Skipped);
        }

        let Some((row, existing)) = self.find(record_id).await? else {
            debug!("ledger has no row for {}", record_id);
            return Ok(FillOutcome::NotFound);
        };
        if !existing.is_empty() {
            debug!("ledger row {} already named {:?}", row, existing);
            return Ok(FillOutcome::AlreadyFilled { row, existing });
        }

        let target = CellRange::cell(&self.layout.sheet, self.layout.name_col, row);
        self.store
            .update_range(&target, vec![vec![candidate.to_string()]])
            .await?;
        info!("ledger {} <- {:?} ({})", target, candidate, record_id);
        Ok(FillOutcome::Filled { row })
    }

    /// First row whose id cell equals `record_id` after trimming, with its
    /// current name.
    async fn find(&self, record_id: &str) -> Result<Option<(u32, String)>, StoreError> {
        let l = self.layout;
        let start = l.id_col.min(l.name_col);
        let end = l.id_col.max(l.name_col);
        let rows = self
            .store
            .get_range(&CellRange::from_row(&l.sheet, start, end, l.first_row))
            .await?;

        let id_idx = (l.id_col - start) as usize;
        let name_idx = (l.name_col - start) as usize;
        Ok(rows.iter().enumerate().find_map(|(i, r)| {
            (cell(r, id_idx).trim() == record_id)
                .then(|| (l.first_row + i as u32, cell(r, name_idx).trim().to_string()))
        }))
    }
}
