use dashmap::DashMap;

/// A single pending operation in the write buffer.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub value: Vec<u8>,
    pub tombstone: bool,
}

/// Result of a buffer lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferHit {
    /// The buffer holds a live value for this key.
    Alive(Vec<u8>),
    /// The buffer holds a tombstone hiding any engine value.
    Deleted,
}

/// In-memory overlay of pending puts and tombstones, merged into reads and
/// flushed to the engine periodically. The buffer holds no schema
/// knowledge; for any key it contains it is authoritative over the engine.
#[derive(Default)]
pub struct WriteBuffer {
    data: DashMap<String, BufferEntry>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a value, clearing any tombstone.
    pub fn put(&self, key: String, value: Vec<u8>) {
        self.data.insert(
            key,
            BufferEntry {
                value,
                tombstone: false,
            },
        );
    }

    /// Records a tombstone; a later `get` reports the key as deleted.
    pub fn delete(&self, key: String) {
        self.data.insert(
            key,
            BufferEntry {
                value: Vec::new(),
                tombstone: true,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<BufferHit> {
        self.data.get(key).map(|entry| {
            if entry.tombstone {
                BufferHit::Deleted
            } else {
                BufferHit::Alive(entry.value.clone())
            }
        })
    }

    /// Atomically takes the current contents, leaving the buffer empty.
    pub fn drain(&self) -> Vec<(String, BufferEntry)> {
        let keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((k, v)) = self.data.remove(&key) {
                drained.push((k, v));
            }
        }
        drained
    }

    /// Visits live (non-tombstone) entries whose key starts with `prefix`.
    pub fn for_each_with_prefix(&self, prefix: &str, mut f: impl FnMut(&str, &BufferEntry)) {
        for entry in self.data.iter() {
            if entry.key().starts_with(prefix) {
                f(entry.key(), entry.value());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get() {
        let buffer = WriteBuffer::new();
        buffer.put("k".into(), b"v".to_vec());
        assert_eq!(buffer.get("k"), Some(BufferHit::Alive(b"v".to_vec())));
        assert_eq!(buffer.get("missing"), None);
    }

    #[test]
    fn test_delete_then_put_clears_tombstone() {
        let buffer = WriteBuffer::new();
        buffer.delete("k".into());
        assert_eq!(buffer.get("k"), Some(BufferHit::Deleted));

        buffer.put("k".into(), b"v2".to_vec());
        assert_eq!(buffer.get("k"), Some(BufferHit::Alive(b"v2".to_vec())));
    }

    #[test]
    fn test_drain_empties_buffer() {
        let buffer = WriteBuffer::new();
        buffer.put("a".into(), b"1".to_vec());
        buffer.delete("b".into());

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert!(buffer.is_empty());

        // Draining again is a no-op.
        assert!(buffer.drain().is_empty());
    }
}
