//! Batch slicing policies
//!
//! A slicer cuts one batched key-value list into one shard per server. The
//! range policy cuts along the server key-range table with two binary
//! searches per server; every shard is a zero-copy segment of the caller's
//! arrays. The modulo policy routes each key by `key % num_servers` and
//! accumulates per-entry slices, preserving the relative order of keys that
//! share a destination.

use bytemuck::Pod;

use crate::kv::{KvPairs, ValueShape};
use crate::range::Range;
use crate::sarray::SArray;
use crate::status::Status;

/// The built-in sharding policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlicerPolicy {
    /// Cut a sorted batch along the server key-range boundaries.
    #[default]
    Range,
    /// Route key `k` to server `k % num_servers`.
    Modulo,
}

impl std::str::FromStr for SlicerPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "range" => Ok(SlicerPolicy::Range),
            "modulo" => Ok(SlicerPolicy::Modulo),
            _ => Err(()),
        }
    }
}

/// One shard per server; `false` marks a shard with nothing to transmit.
pub type Sliced<V> = Vec<(bool, KvPairs<V>)>;

/// A pluggable slicer: `(batch, ranges) -> sliced`.
///
/// Installed via [`KvWorker::set_slicer`](crate::worker::KvWorker::set_slicer);
/// the built-ins are [`range_slicer`] and [`modulo_slicer`].
pub type SlicerFn<V> = Box<dyn Fn(&KvPairs<V>, &[Range]) -> Result<Sliced<V>, Status> + Send + Sync>;

/// Box the built-in slicer for `policy`.
pub fn slicer_for<V: Pod>(policy: SlicerPolicy) -> SlicerFn<V> {
    match policy {
        SlicerPolicy::Range => Box::new(range_slicer),
        SlicerPolicy::Modulo => Box::new(modulo_slicer),
    }
}

fn all_inactive<V: Pod>(n: usize) -> Sliced<V> {
    (0..n).map(|_| (false, KvPairs::default())).collect()
}

/// Slice a sorted batch along the server key ranges.
///
/// Requires `send.keys` sorted strictly ascending and adjacent ranges
/// touching. A key equal to a range boundary lands in the higher server.
/// Shard arrays alias the caller's buffers; no element data is copied.
pub fn range_slicer<V: Pod>(send: &KvPairs<V>, ranges: &[Range]) -> Result<Sliced<V>, Status> {
    let n = ranges.len();
    let keys = send.keys.as_slice();

    if !keys.windows(2).all(|w| w[0] < w[1]) {
        return Err(Status::InvalidArgument);
    }
    for w in ranges.windows(2) {
        if w[0].end != w[1].begin {
            return Err(Status::Corruption);
        }
    }

    // Cut positions: pos[s] is the lower bound of ranges[s].begin, pos[s+1]
    // of ranges[s].end.
    let mut pos = Vec::with_capacity(n + 1);
    pos.push(keys.partition_point(|&k| k < ranges[0].begin));
    for r in ranges {
        pos.push(keys.partition_point(|&k| k < r.end));
    }
    if pos[0] != 0 || pos[n] != keys.len() {
        // Keys outside the table would silently fall out of every shard.
        return Err(Status::Corruption);
    }

    let shape = send.value_shape()?;
    let mut sliced = all_inactive(n);
    if keys.is_empty() {
        return Ok(sliced);
    }

    let mut val_begin = 0usize;
    for s in 0..n {
        if pos[s + 1] == pos[s] {
            continue;
        }
        let kv = KvPairs {
            keys: send.keys.segment(pos[s], pos[s + 1]),
            vals: match shape {
                ValueShape::Uniform(k) => send.vals.segment(pos[s] * k, pos[s + 1] * k),
                ValueShape::Explicit => {
                    let val_end = val_begin
                        + send.lens.as_slice()[pos[s]..pos[s + 1]]
                            .iter()
                            .map(|&l| l as usize)
                            .sum::<usize>();
                    let seg = send.vals.segment(val_begin, val_end);
                    val_begin = val_end;
                    seg
                }
            },
            lens: if send.lens.is_empty() {
                SArray::new()
            } else {
                send.lens.segment(pos[s], pos[s + 1])
            },
        };
        sliced[s] = (true, kv);
    }
    Ok(sliced)
}

/// Slice a batch by key residue: key `k` goes to server `k % num_servers`.
///
/// Keys need not be sorted. Within a shard, keys keep the relative order
/// they had in the input; pull reassembly relies on this.
pub fn modulo_slicer<V: Pod>(send: &KvPairs<V>, ranges: &[Range]) -> Result<Sliced<V>, Status> {
    let n = ranges.len();
    let mut sliced = all_inactive(n);
    if send.keys.is_empty() {
        return Ok(sliced);
    }
    let shape = send.value_shape()?;

    let keys = send.keys.as_slice();
    let mut val_begin = 0usize;
    for (i, &key) in keys.iter().enumerate() {
        let s = (key % n as u64) as usize;
        sliced[s].0 = true;
        let kv = &mut sliced[s].1;
        kv.keys.push(key);
        match shape {
            ValueShape::Uniform(k) => {
                kv.vals.append(&send.vals.segment(i * k, (i + 1) * k));
            }
            ValueShape::Explicit => {
                let len = send.lens[i];
                let val_end = val_begin + len as usize;
                kv.lens.push(len);
                kv.vals.append(&send.vals.segment(val_begin, val_end));
                val_begin = val_end;
            }
        }
    }
    Ok(sliced)
}
