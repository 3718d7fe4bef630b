/// Atomic Multi-CF Database Writer
///
/// Queues puts and deletes across column families and commits them in a
/// single RocksDB WriteBatch: either every queued operation lands or none do.
///
/// Used by the restore engine so that a rollback (record deletes, bucket
/// truncation, undo resurrection) cannot be half-applied, and by bootstrap
/// to wipe derived column families in bounded chunks.

use std::collections::HashMap;
use std::sync::Arc;

use rocksdb::{WriteBatch, DB};
use tracing::{debug, error, warn};

use crate::error::{IndexerError, Result};
use crate::metrics;

/// Atomic batch writer that commits writes across multiple column families atomically
pub struct AtomicBatchWriter {
    db: Arc<DB>,
    operations: Vec<Operation>,
    batch_size_limit: usize,
}

#[derive(Clone)]
enum Operation {
    Put {
        cf_name: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: &'static str,
        key: Vec<u8>,
    },
}

impl Operation {
    fn cf_name(&self) -> &'static str {
        match self {
            Operation::Put { cf_name, .. } | Operation::Delete { cf_name, .. } => cf_name,
        }
    }
}

impl AtomicBatchWriter {
    /// `batch_size_limit` is the operation count at which `should_flush` turns true
    pub fn new(db: Arc<DB>, batch_size_limit: usize) -> Self {
        Self {
            db,
            operations: Vec::new(),
            batch_size_limit,
        }
    }

    pub fn put(&mut self, cf_name: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.operations.push(Operation::Put { cf_name, key, value });
    }

    pub fn delete(&mut self, cf_name: &'static str, key: Vec<u8>) {
        self.operations.push(Operation::Delete { cf_name, key });
    }

    /// Check if batch should be flushed based on size
    pub fn should_flush(&self) -> bool {
        self.operations.len() >= self.batch_size_limit
    }

    /// Get number of pending operations
    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Commit all queued operations in one WriteBatch.
    ///
    /// On error nothing from this batch is written and the queue is empty.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.operations.is_empty() {
            return Ok(0);
        }

        let pending_ops = self.operations.len();
        let timer = metrics::Timer::new();
        debug!(pending_ops, "Batch flush start");

        let operations = std::mem::take(&mut self.operations);
        let db = self.db.clone();

        let (write_result, cf_batch_sizes) = tokio::task::spawn_blocking(
            move || -> (Result<()>, HashMap<&'static str, usize>) {
                let mut batch = WriteBatch::default();
                let mut cf_batch_sizes: HashMap<&'static str, usize> = HashMap::new();

                for op in &operations {
                    let cf_name = op.cf_name();
                    let Some(cf) = db.cf_handle(cf_name) else {
                        let msg = format!("Column family not found: {}", cf_name);
                        return (Err(IndexerError::Config(msg)), cf_batch_sizes);
                    };
                    *cf_batch_sizes.entry(cf_name).or_default() += 1;
                    match op {
                        Operation::Put { key, value, .. } => batch.put_cf(cf, key, value),
                        Operation::Delete { key, .. } => batch.delete_cf(cf, key),
                    }
                }

                // single commit for every column family touched
                let write_result = db.write(batch).map_err(IndexerError::from);
                (write_result, cf_batch_sizes)
            },
        )
        .await?;

        let elapsed_secs = timer.elapsed_secs();
        metrics::record_batch_write(write_result.is_ok(), elapsed_secs);

        match write_result {
            Ok(()) => {
                if elapsed_secs > 10.0 {
                    let cf_list: Vec<&str> = cf_batch_sizes.keys().copied().collect();
                    warn!(
                        cf = cf_list.join(","),
                        batch_size = pending_ops,
                        duration_secs = elapsed_secs,
                        "Slow database flush"
                    );
                } else {
                    debug!(
                        cf_count = cf_batch_sizes.len(),
                        batch_size = pending_ops,
                        duration_ms = format!("{:.2}", elapsed_secs * 1000.0),
                        "Flush complete"
                    );
                }
                Ok(pending_ops)
            }
            Err(e) => {
                error!(batch_size = pending_ops, error = %e, "Flush error");
                Err(e)
            }
        }
    }

    /// Clear all pending operations without writing
    pub fn clear(&mut self) {
        self.operations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rocksdb::Options;
    use tempfile::TempDir;

    fn create_test_db() -> (Arc<DB>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_names = vec!["cf1", "cf2", "cf3"];
        let db = DB::open_cf(&opts, temp_dir.path(), &cf_names).unwrap();
        (Arc::new(db), temp_dir)
    }

    #[tokio::test]
    async fn test_atomic_write_all_succeed() {
        let (db, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(db.clone(), 1000);

        writer.put("cf1", b"key1".to_vec(), b"value1".to_vec());
        writer.put("cf2", b"key2".to_vec(), b"value2".to_vec());
        writer.delete("cf3", b"missing".to_vec());

        assert_eq!(writer.flush().await.unwrap(), 3);

        let cf1 = db.cf_handle("cf1").unwrap();
        let cf2 = db.cf_handle("cf2").unwrap();
        assert_eq!(db.get_cf(cf1, b"key1").unwrap().unwrap(), b"value1");
        assert_eq!(db.get_cf(cf2, b"key2").unwrap().unwrap(), b"value2");
    }

    #[tokio::test]
    async fn test_unknown_cf_writes_nothing() {
        let (db, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(db.clone(), 1000);

        writer.put("cf1", b"key1".to_vec(), b"value1".to_vec());
        writer.put("nope", b"key2".to_vec(), b"value2".to_vec());

        assert!(writer.flush().await.is_err());
        assert_eq!(writer.pending_count(), 0);

        let cf1 = db.cf_handle("cf1").unwrap();
        assert!(db.get_cf(cf1, b"key1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_should_flush_and_clear() {
        let (db, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(db, 2);

        assert!(!writer.should_flush());
        writer.put("cf1", b"key1".to_vec(), b"value1".to_vec());
        assert!(!writer.should_flush());
        writer.delete("cf2", b"key2".to_vec());
        assert!(writer.should_flush());

        writer.clear();
        assert_eq!(writer.pending_count(), 0);
        assert_eq!(writer.flush().await.unwrap(), 0);
    }
}
