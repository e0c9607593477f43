//! Reference caches: serialized-form identity and cycle preservation.
//!
//! The write cache assigns each heap object a sequential marker the first
//! time it is encoded; repeats emit only the marker. The read cache maps
//! markers back to reconstructed values. Both are scoped to one
//! snapshot/restore call and never reused.

use hashbrown::HashMap;

use tove_runtime::{BufferError, ByteBuffer, Value};

use crate::error::{Result, SnapshotError};

/// Write-side identity tracking. Keys are heap-object addresses.
#[derive(Debug, Default)]
pub struct WriteCache {
    markers: HashMap<usize, u64>,
    next: u64,
}

impl WriteCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit the marker for `identity` and report whether the object was
    /// already seen. On the first encounter the caller must follow up with
    /// the full body; on a repeat it must not.
    pub fn check_or_register(&mut self, identity: usize, buf: &mut ByteBuffer) -> bool {
        if let Some(&marker) = self.markers.get(&identity) {
            buf.put_u64(marker);
            return true;
        }
        let marker = self.next;
        self.next += 1;
        self.markers.insert(identity, marker);
        buf.put_u64(marker);
        false
    }
}

/// Read-side marker resolution.
#[derive(Debug, Default)]
pub struct ReadCache {
    values: HashMap<u64, Value>,
}

impl ReadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the marker written by the encoder. Returns the cached value
    /// if this marker was seen before; otherwise the caller must decode the
    /// body and `insert` the object under the marker *before* recursing
    /// into its children, so cycles resolve against the cache.
    pub fn check_or_reserve(
        &mut self,
        buf: &mut ByteBuffer,
    ) -> std::result::Result<(u64, Option<Value>), BufferError> {
        let marker = buf.get_u64()?;
        Ok((marker, self.values.get(&marker).cloned()))
    }

    pub fn insert(&mut self, marker: u64, value: Value) -> Result<()> {
        if self.values.insert(marker, value).is_some() {
            return Err(SnapshotError::Corrupt("marker assigned twice"));
        }
        Ok(())
    }

    /// Swap the value cached under an already-assigned marker. Used when a
    /// placeholder must give way to a pre-existing live object (singleton
    /// instances) or to a Null substitute.
    pub fn replace(&mut self, marker: u64, value: Value) -> Result<()> {
        if self.values.insert(marker, value).is_none() {
            return Err(SnapshotError::Corrupt("marker never assigned"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tove_runtime::{Object, Table};

    #[test]
    fn markers_are_sequential_per_identity() {
        let mut cache = WriteCache::new();
        let mut buf = ByteBuffer::new();

        assert!(!cache.check_or_register(0x1000, &mut buf));
        assert!(!cache.check_or_register(0x2000, &mut buf));
        assert!(cache.check_or_register(0x1000, &mut buf));

        assert_eq!(buf.get_u64(), Ok(0));
        assert_eq!(buf.get_u64(), Ok(1));
        assert_eq!(buf.get_u64(), Ok(0));
    }

    #[test]
    fn read_cache_resolves_repeats() {
        let mut cache = ReadCache::new();
        let mut buf = ByteBuffer::new();
        buf.put_u64(0);
        buf.put_u64(0);

        let (marker, cached) = cache.check_or_reserve(&mut buf).unwrap();
        assert_eq!(marker, 0);
        assert!(cached.is_none());

        let table = Value::object(Object::Table(Table::new()));
        cache.insert(marker, table.clone()).unwrap();

        let (_, cached) = cache.check_or_reserve(&mut buf).unwrap();
        assert_eq!(cached.unwrap(), table);

        assert!(cache.insert(marker, Value::Null).is_err());
    }

    #[test]
    fn replace_requires_an_assigned_marker() {
        let mut cache = ReadCache::new();
        assert!(cache.replace(0, Value::Null).is_err());

        cache.insert(0, Value::Int(1)).unwrap();
        cache.replace(0, Value::Int(2)).unwrap();

        let mut buf = ByteBuffer::new();
        buf.put_u64(0);
        let (_, cached) = cache.check_or_reserve(&mut buf).unwrap();
        assert_eq!(cached, Some(Value::Int(2)));
    }
}
