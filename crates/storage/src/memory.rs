use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self, column: Column) -> usize {
        let guard = self.inner.read().expect("memory store lock");
        guard.keys().filter(|(col, _)| *col == column).count()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"key".as_slice(), b"one".as_slice());
        batch.delete(Column::Meta, b"key".as_slice());
        batch.put(Column::Meta, b"key".as_slice(), b"two".as_slice());
        store.write_batch(&batch).expect("write");
        assert_eq!(
            store.get(Column::Meta, b"key").expect("get"),
            Some(b"two".to_vec())
        );
    }

    #[test]
    fn columns_are_disjoint() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"k", b"utxo").expect("put");
        store.put(Column::Meta, b"k", b"meta").expect("put");
        assert_eq!(
            store.get(Column::Utxo, b"k").expect("get"),
            Some(b"utxo".to_vec())
        );
        assert_eq!(store.entry_count(Column::Utxo), 1);
    }

    #[test]
    fn prefix_scan_filters() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"aa1", b"1").expect("put");
        store.put(Column::Meta, b"aa2", b"2").expect("put");
        store.put(Column::Meta, b"bb1", b"3").expect("put");
        let hits = store.scan_prefix(Column::Meta, b"aa").expect("scan");
        assert_eq!(hits.len(), 2);
    }
}
