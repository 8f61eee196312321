use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{Engine, IterFlow};
use crate::error::{DbError, DbResult};

/// In-memory engine over an ordered map. Used by tests and embedders that
/// do not need persistence; prefix scans are lexicographic like RocksDB's.
#[derive(Default)]
pub struct MemoryEngine {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Engine for MemoryEngine {
    fn set(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> DbResult<Vec<u8>> {
        self.data
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| DbError::NotFound(String::from_utf8_lossy(key).into_owned()))
    }

    fn delete(&self, key: &[u8]) -> DbResult<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    fn batch_set(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> DbResult<()> {
        let mut data = self.data.write().unwrap();
        for (key, value) in entries {
            data.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> DbResult<IterFlow>,
    ) -> DbResult<()> {
        // Snapshot matching entries so the callback may call back into the
        // engine without deadlocking on the read lock.
        let matching: Vec<(Vec<u8>, Vec<u8>)> = {
            let data = self.data.read().unwrap();
            data.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in matching {
            if f(&key, &value)? == IterFlow::Stop {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_is_not_found() {
        let engine = MemoryEngine::new();
        assert!(engine.get(b"nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_prefix_scan_skips_other_keys() {
        let engine = MemoryEngine::new();
        engine.set(b"IDX:a:1", b"1").unwrap();
        engine.set(b"IDX:b:1", b"1").unwrap();
        engine.set(b"DATA:a", b"row").unwrap();

        let mut count = 0;
        engine
            .iterate_prefix(b"IDX:a", &mut |_, _| {
                count += 1;
                Ok(IterFlow::Continue)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_stop_halts_iteration() {
        let engine = MemoryEngine::new();
        for i in 0..5u8 {
            engine.set(format!("k:{}", i).as_bytes(), b"v").unwrap();
        }
        let mut count = 0;
        engine
            .iterate_prefix(b"k:", &mut |_, _| {
                count += 1;
                Ok(if count == 2 { IterFlow::Stop } else { IterFlow::Continue })
            })
            .unwrap();
        assert_eq!(count, 2);
    }
}
