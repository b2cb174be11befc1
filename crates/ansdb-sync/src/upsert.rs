//! Fixed-size batched persistence with per-batch rollback.

use ansdb_core::{BatchFailure, EntityKind, RowOutcome, RowSkip, RunSummary, SkipKind};
use tracing::{debug, info, warn};

use crate::store::BatchWriter;

pub struct UpsertEngine<'s, S: ?Sized> {
    store: &'s S,
}

impl<'s, S: ?Sized> UpsertEngine<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Group accepted records into consecutive batches of `batch_size` and
    /// commit each one atomically.
    ///
    /// A failed batch is logged and recorded, never retried; later batches
    /// still run. Skipped rows are tallied into the summary.
    pub async fn persist<R, I>(
        &self,
        source: &str,
        entity: EntityKind,
        records: I,
        batch_size: usize,
    ) -> RunSummary
    where
        S: BatchWriter<R>,
        R: Send + Sync,
        I: IntoIterator<Item = RowOutcome<R>>,
    {
        let batch_size = batch_size.max(1);
        let mut summary = RunSummary::new(entity, source);
        let mut batch = Vec::with_capacity(batch_size);
        let mut batch_index = 0usize;
        let mut accepted = 0usize;

        for outcome in records {
            match outcome {
                RowOutcome::Accepted(record) => {
                    batch.push(record);
                    accepted += 1;
                    if batch.len() == batch_size {
                        batch_index += 1;
                        self.commit(&mut summary, &batch, batch_index, accepted - batch.len())
                            .await;
                        batch.clear();
                    }
                }
                RowOutcome::Skipped(skip) => {
                    log_skip(source, &skip);
                    summary.record_skip(&skip.reason);
                }
            }
        }

        if !batch.is_empty() {
            batch_index += 1;
            self.commit(&mut summary, &batch, batch_index, accepted - batch.len())
                .await;
        }

        summary
    }

    async fn commit<R>(&self, summary: &mut RunSummary, batch: &[R], index: usize, first_record: usize)
    where
        S: BatchWriter<R>,
        R: Send + Sync,
    {
        match BatchWriter::<R>::write_batch(self.store, batch).await {
            Ok(written) => {
                summary.imported += written;
                info!(
                    source = %summary.source,
                    batch = index,
                    rows = batch.len(),
                    imported = summary.imported,
                    "batch committed"
                );
            }
            Err(err) => {
                warn!(
                    source = %summary.source,
                    batch = index,
                    first_record,
                    last_record = first_record + batch.len() - 1,
                    error = %err,
                    "batch rolled back"
                );
                summary.failed_batches.push(BatchFailure {
                    index,
                    first_record,
                    records: batch.len(),
                    error: err.to_string(),
                });
            }
        }
    }
}

fn log_skip(source: &str, skip: &RowSkip) {
    let registro_ans = skip.registro_ans.as_deref().unwrap_or("-");
    if skip.reason.kind() == SkipKind::Filtered {
        debug!(source, line = skip.line, registro_ans, reason = %skip.reason, "row filtered");
    } else {
        warn!(source, line = skip.line, registro_ans, reason = %skip.reason, "row skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ansdb_core::{Operator, SkipReason};

    use crate::memory::MemoryStore;

    fn ok(key: &str) -> RowOutcome<Operator> {
        RowOutcome::Accepted(Operator::new(key))
    }

    #[tokio::test]
    async fn partial_tail_batch_is_committed() {
        let store = MemoryStore::new();
        let rows = vec![ok("1"), ok("2"), ok("3"), ok("4"), ok("5")];
        let summary = UpsertEngine::new(&store)
            .persist("cadop.csv", EntityKind::Operator, rows, 2)
            .await;
        assert_eq!(summary.imported, 5);
        assert!(summary.failed_batches.is_empty());
        assert_eq!(store.operators().await.len(), 5);
    }

    #[tokio::test]
    async fn skipped_rows_do_not_shift_batches() {
        let store = MemoryStore::new();
        let skip = RowOutcome::Skipped(RowSkip {
            line: 3,
            registro_ans: None,
            reason: SkipReason::ConstraintViolation("registro_ans is null".into()),
        });
        let rows = vec![ok("1"), skip, ok("2")];
        let summary = UpsertEngine::new(&store)
            .persist("cadop.csv", EntityKind::Operator, rows, 500)
            .await;
        assert_eq!(summary.imported, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.skipped_by_kind[&SkipKind::ConstraintViolation], 1);
    }
}
