//! Generic "apply N operations, collect per-item errors, never abort the
//! batch" executor. Used by the bulk directory build and snapshot restore.

use crate::database::Database;
use crate::error::AppError;

/// Outcome of one batch invocation. `errors` is ordered by occurrence and
/// each entry names the failing item's external id.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub applied: usize,
    pub errors: Vec<String>,
}

impl BatchReport {
    pub fn record_error(&mut self, detail: &impl std::fmt::Display, url: &str) {
        self.errors.push(format!("Error saving anime \"{}\": {}", detail, url));
    }
}

/// Run `op` over every item inside one unit of work. A failing item is
/// rolled back to its savepoint so it performs no write, its error is
/// recorded, and the batch continues; the surviving items commit together.
/// Faults from the transaction machinery itself propagate and roll the
/// whole unit back.
pub fn run_batch<T>(
    db: &Database,
    items: &[T],
    id_of: impl Fn(&T) -> &str,
    op: impl FnMut(&T) -> Result<(), AppError>,
) -> Result<BatchReport, AppError> {
    let uow = db.begin()?;
    let report = apply_batch(db, items, id_of, op)?;
    uow.commit()?;
    Ok(report)
}

/// Savepoint-per-item loop for callers that already hold an open unit of
/// work and need other writes to commit or abort together with the batch.
pub(crate) fn apply_batch<T>(
    db: &Database,
    items: &[T],
    id_of: impl Fn(&T) -> &str,
    mut op: impl FnMut(&T) -> Result<(), AppError>,
) -> Result<BatchReport, AppError> {
    let mut report = BatchReport::default();

    for item in items {
        db.savepoint("batch_item")?;
        match op(item) {
            Ok(()) => {
                db.release_savepoint("batch_item")?;
                report.applied += 1;
            }
            Err(e) => {
                db.rollback_to_savepoint("batch_item")?;
                db.release_savepoint("batch_item")?;
                report.record_error(&e, id_of(item));
            }
        }
    }

    log::info!(
        "Batch finished: {} applied, {} failed",
        report.applied,
        report.errors.len()
    );
    Ok(report)
}
