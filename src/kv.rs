//! Key-value batch types
//!
//! A batched operation is three parallel arrays: unique ascending keys, a
//! contiguous value buffer, and optional per-entry value lengths. With no
//! lengths every entry holds `|vals| / |keys|` values; with lengths entry
//! `i` holds `lens[i]` values starting at the prefix sum of the earlier
//! lengths. The two encodings are never mixed within one batch.

use bytemuck::Pod;

use crate::post::NodeId;
use crate::sarray::SArray;
use crate::status::Status;

/// A key in the global key space.
pub type Key = u64;

/// Per-entry value length.
pub type Len = i32;

/// Identifier of one logical push or pull invocation (not wall-clock time).
pub type Timestamp = i32;

/// A batched list of key-value pairs.
pub struct KvPairs<V: Pod> {
    /// Unique keys, sorted ascending for range-sliced traffic.
    pub keys: SArray<Key>,
    /// Concatenated values of all entries.
    pub vals: SArray<V>,
    /// Per-entry value lengths; empty for the uniform encoding.
    pub lens: SArray<Len>,
}

/// How the value buffer of a batch is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// Every entry holds the same number of values.
    Uniform(usize),
    /// Entry `i` holds `lens[i]` values.
    Explicit,
}

impl<V: Pod> KvPairs<V> {
    /// Number of entries in the batch.
    #[inline]
    pub fn num_entries(&self) -> usize {
        self.keys.len()
    }

    /// Validate the batch shape and report which value encoding it uses.
    ///
    /// Fails with [`Status::InvalidArgument`] when the value count is not a
    /// multiple of the key count (uniform encoding), when the length count
    /// differs from the key count, or when the lengths do not sum to the
    /// value count (explicit encoding).
    pub fn value_shape(&self) -> Result<ValueShape, Status> {
        if self.lens.is_empty() {
            if self.keys.is_empty() {
                return if self.vals.is_empty() {
                    Ok(ValueShape::Uniform(0))
                } else {
                    Err(Status::InvalidArgument)
                };
            }
            let k = self.vals.len() / self.keys.len();
            if k * self.keys.len() != self.vals.len() {
                return Err(Status::InvalidArgument);
            }
            Ok(ValueShape::Uniform(k))
        } else {
            if self.lens.len() != self.keys.len() {
                return Err(Status::InvalidArgument);
            }
            let total: usize = self.lens.iter().map(|&l| l as usize).sum();
            if total != self.vals.len() {
                return Err(Status::InvalidArgument);
            }
            Ok(ValueShape::Explicit)
        }
    }
}

impl<V: Pod> Default for KvPairs<V> {
    fn default() -> Self {
        Self {
            keys: SArray::new(),
            vals: SArray::new(),
            lens: SArray::new(),
        }
    }
}

impl<V: Pod> Clone for KvPairs<V> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            vals: self.vals.clone(),
            lens: self.lens.clone(),
        }
    }
}

impl<V: Pod + std::fmt::Debug> std::fmt::Debug for KvPairs<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvPairs")
            .field("keys", &self.keys)
            .field("vals", &self.vals)
            .field("lens", &self.lens)
            .finish()
    }
}

/// Metadata of one key-value request as seen by a server handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvMeta {
    /// Application-defined command.
    pub cmd: i32,
    /// Whether this is a push (as opposed to a pull).
    pub push: bool,
    /// Node id of the originating worker.
    pub sender: NodeId,
    /// Timestamp of the request on the originating customer.
    pub timestamp: Timestamp,
    /// Customer id of the originating worker.
    pub customer_id: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(keys: &[Key], vals: &[f32], lens: &[Len]) -> KvPairs<f32> {
        KvPairs {
            keys: SArray::from_slice(keys),
            vals: SArray::from_slice(vals),
            lens: SArray::from_slice(lens),
        }
    }

    #[test]
    fn test_uniform_shape() {
        let kvs = batch(&[1, 3], &[1.0, 1.1, 3.0, 3.1], &[]);
        assert_eq!(kvs.value_shape().unwrap(), ValueShape::Uniform(2));
    }

    #[test]
    fn test_uniform_shape_indivisible() {
        let kvs = batch(&[1, 3], &[1.0, 2.0, 3.0], &[]);
        assert_eq!(kvs.value_shape().unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn test_explicit_shape() {
        let kvs = batch(&[5, 15], &[1.0, 2.0, 3.0, 7.0, 8.0], &[3, 2]);
        assert_eq!(kvs.value_shape().unwrap(), ValueShape::Explicit);
    }

    #[test]
    fn test_explicit_shape_mismatches() {
        let kvs = batch(&[5, 15], &[1.0, 2.0], &[3]);
        assert_eq!(kvs.value_shape().unwrap_err(), Status::InvalidArgument);

        let kvs = batch(&[5, 15], &[1.0, 2.0], &[3, 2]);
        assert_eq!(kvs.value_shape().unwrap_err(), Status::InvalidArgument);
    }

    #[test]
    fn test_empty_batch() {
        let kvs: KvPairs<f32> = KvPairs::default();
        assert_eq!(kvs.value_shape().unwrap(), ValueShape::Uniform(0));
        assert_eq!(kvs.num_entries(), 0);
    }
}
