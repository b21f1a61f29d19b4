//! Message envelope and the key-value payload adapter
//!
//! A message is a metadata header plus an ordered list of opaque byte
//! segments. Key-value traffic uses a fixed segment layout:
//!
//! ```text
//! data[0] = keys  (u64, reinterpreted as bytes)
//! data[1] = vals  (V, reinterpreted as bytes)
//! data[2] = lens  (i32, only for the explicit-length encoding)
//! ```
//!
//! Packing and unpacking share the batch's storage with the wire view; no
//! element data is copied in either direction.

use bytemuck::Pod;

use crate::kv::{KvPairs, Key, Len, Timestamp};
use crate::post::NodeId;
use crate::sarray::SArray;
use crate::status::Status;

/// Metadata header of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Meta {
    /// Application id; workers and servers of one app share it.
    pub app_id: i32,
    /// Customer id, unique per node within an app.
    pub customer_id: i32,
    /// Timestamp of the request this message belongs to.
    pub timestamp: Timestamp,
    /// Sending node.
    pub sender: NodeId,
    /// Receiving node.
    pub recver: NodeId,
    /// Whether this is a request (as opposed to a response).
    pub request: bool,
    /// Whether the request is a push (as opposed to a pull).
    pub push: bool,
    /// Application-defined command.
    pub cmd: i32,
    /// Whether the message belongs to the simple-app channel rather than
    /// key-value traffic.
    pub simple_app: bool,
}

/// A transport message: metadata plus opaque data segments.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Metadata header.
    pub meta: Meta,
    /// Opaque byte segments.
    pub data: Vec<SArray<u8>>,
}

impl Message {
    /// Create a message with the given metadata and no data segments.
    pub fn new(meta: Meta) -> Self {
        Self {
            meta,
            data: Vec::new(),
        }
    }

    /// Append a typed array as an opaque data segment (shares storage).
    pub fn add_data<T: Pod>(&mut self, arr: &SArray<T>) {
        self.data.push(arr.as_bytes());
    }

    /// Total payload size in bytes.
    pub fn data_bytes(&self) -> usize {
        self.data.iter().map(|d| d.len()).sum()
    }

    /// Attach a key-value batch as data segments.
    ///
    /// An entirely empty batch attaches nothing; otherwise keys and values
    /// are attached, plus lengths when present.
    pub fn pack_kv<V: Pod>(&mut self, kvs: &KvPairs<V>) {
        if kvs.keys.is_empty() {
            return;
        }
        self.add_data(&kvs.keys);
        self.add_data(&kvs.vals);
        if !kvs.lens.is_empty() {
            self.add_data(&kvs.lens);
        }
    }

    /// Decode the data segments back into a typed key-value batch.
    ///
    /// Accepts 0 segments (empty batch), 2 (keys + vals) or 3 (keys + vals
    /// + lens, with `|lens| == |keys|`); anything else is malformed. Segment
    /// bytes are reinterpreted in place, not copied.
    pub fn unpack_kv<V: Pod>(&self) -> Result<KvPairs<V>, Status> {
        match self.data.len() {
            0 => Ok(KvPairs::default()),
            2 | 3 => {
                let keys = SArray::<Key>::from_bytes(&self.data[0])?;
                let vals = SArray::<V>::from_bytes(&self.data[1])?;
                let lens = if self.data.len() == 3 {
                    let lens = SArray::<Len>::from_bytes(&self.data[2])?;
                    if lens.len() != keys.len() {
                        return Err(Status::Corruption);
                    }
                    lens
                } else {
                    SArray::new()
                };
                Ok(KvPairs { keys, vals, lens })
            }
            _ => Err(Status::Corruption),
        }
    }
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
    fn test_pack_unpack_uniform() {
        let kvs = batch(&[2, 12], &[1.0, 2.0], &[]);
        let mut msg = Message::default();
        msg.pack_kv(&kvs);
        assert_eq!(msg.data.len(), 2);
        assert_eq!(msg.data_bytes(), 2 * 8 + 2 * 4);

        let back = msg.unpack_kv::<f32>().unwrap();
        assert_eq!(back.keys.as_slice(), &[2, 12]);
        assert_eq!(back.vals.as_slice(), &[1.0, 2.0]);
        assert!(back.lens.is_empty());
    }

    #[test]
    fn test_pack_unpack_with_lens() {
        let kvs = batch(&[5, 15], &[1.0, 2.0, 3.0, 7.0, 8.0], &[3, 2]);
        let mut msg = Message::default();
        msg.pack_kv(&kvs);
        assert_eq!(msg.data.len(), 3);

        let back = msg.unpack_kv::<f32>().unwrap();
        assert_eq!(back.lens.as_slice(), &[3, 2]);
        assert_eq!(back.vals.as_slice(), &[1.0, 2.0, 3.0, 7.0, 8.0]);
    }

    #[test]
    fn test_pack_empty_batch_attaches_nothing() {
        let mut msg = Message::default();
        msg.pack_kv(&KvPairs::<f32>::default());
        assert!(msg.data.is_empty());
        let back = msg.unpack_kv::<f32>().unwrap();
        assert!(back.keys.is_empty());
    }

    #[test]
    fn test_unpack_rejects_one_segment() {
        let mut msg = Message::default();
        msg.add_data(&SArray::from_slice(&[1u64]));
        assert_eq!(msg.unpack_kv::<f32>().unwrap_err(), Status::Corruption);
    }

    #[test]
    fn test_unpack_rejects_len_mismatch() {
        let mut msg = Message::default();
        msg.add_data(&SArray::from_slice(&[1u64, 2]));
        msg.add_data(&SArray::from_slice(&[1.0f32, 2.0]));
        msg.add_data(&SArray::from_slice(&[1i32]));
        assert_eq!(msg.unpack_kv::<f32>().unwrap_err(), Status::Corruption);
    }

    #[test]
    fn test_unpack_shares_storage() {
        let kvs = batch(&[7], &[9.0], &[]);
        let mut msg = Message::default();
        msg.pack_kv(&kvs);
        let back = msg.unpack_kv::<f32>().unwrap();
        assert_eq!(back.keys.as_ptr(), kvs.keys.as_ptr());
        assert_eq!(back.vals.as_ptr(), kvs.vals.as_ptr());
    }
}
