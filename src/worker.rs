//! Worker-side request multiplexer
//!
//! A worker turns one logical push or pull into per-server shard messages
//! (fan-out) and turns the per-server responses back into a single
//! completion (fan-in). Each request gets one timestamp; shards that carry
//! nothing are pre-credited so the fan-in completes even when some servers
//! receive no message. Pull responses are buffered per timestamp and merged
//! back into the caller's key order on the last response.
//!
//! Completion callbacks run exactly once, on the customer's dispatcher
//! thread (or synchronously on the issuing thread when every shard was
//! inactive). Re-entrant worker calls from inside a callback are fine; they
//! allocate fresh timestamps.

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use crate::customer::{Customer, ResponseTracker};
use crate::kv::{KvPairs, Key, Len, Timestamp};
use crate::message::{Message, Meta};
use crate::post::Postoffice;
use crate::range::find_range;
use crate::sarray::SArray;
use crate::slicer::{slicer_for, Sliced, SlicerFn, SlicerPolicy};
use crate::status::Status;

/// User callback run exactly once when a request completes.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Internal per-timestamp completion, run with the worker lock released.
type CompletionFn<V> = Box<dyn FnOnce(&WorkerInner<V>) + Send>;

struct WorkerState<V: Pod> {
    /// Pull response fragments per timestamp, in arrival order.
    recv_kvs: HashMap<Timestamp, Vec<KvPairs<V>>>,
    /// Completion per timestamp; removed before it runs.
    callbacks: HashMap<Timestamp, CompletionFn<V>>,
    /// Merged pull results awaiting [`KvWorker::wait_pull`].
    pulled: HashMap<Timestamp, KvPairs<V>>,
}

struct WorkerInner<V: Pod> {
    app_id: i32,
    customer_id: i32,
    po: Arc<Postoffice>,
    policy: SlicerPolicy,
    slicer: RwLock<SlicerFn<V>>,
    tracker: Arc<ResponseTracker>,
    state: Mutex<WorkerState<V>>,
}

/// A worker node's handle for pushing and pulling key-value pairs.
///
/// All methods take `&self`; share the worker between threads (or capture an
/// `Arc` of it in completion callbacks) to issue concurrent requests.
pub struct KvWorker<V: Pod + Send + Sync> {
    inner: Arc<WorkerInner<V>>,
    customer: Customer,
}

impl<V: Pod + Send + Sync> KvWorker<V> {
    /// Create a worker for `app_id` with a locally unique `customer_id`.
    ///
    /// Registers a customer with the node's postoffice and starts its
    /// dispatcher thread.
    pub fn new(
        app_id: i32,
        customer_id: i32,
        policy: SlicerPolicy,
        po: Arc<Postoffice>,
    ) -> Result<Self, Status> {
        let tracker = Arc::new(ResponseTracker::new());
        let inner = Arc::new(WorkerInner {
            app_id,
            customer_id,
            po: po.clone(),
            policy,
            slicer: RwLock::new(slicer_for(policy)),
            tracker: tracker.clone(),
            state: Mutex::new(WorkerState {
                recv_kvs: HashMap::new(),
                callbacks: HashMap::new(),
                pulled: HashMap::new(),
            }),
        });
        let handle = {
            let inner = inner.clone();
            Box::new(move |msg| inner.process(msg))
        };
        let customer = Customer::new(app_id, customer_id, tracker, po, handle)?;
        Ok(Self { inner, customer })
    }

    /// Push key-value pairs to the owning servers, copying the inputs.
    ///
    /// `lens` is empty for the uniform encoding. Returns immediately with
    /// the request timestamp; use [`wait`](Self::wait) or the callback to
    /// learn when the push landed.
    pub fn push(
        &self,
        keys: &[Key],
        vals: &[V],
        lens: &[Len],
        cmd: i32,
        cb: Option<Callback>,
    ) -> Result<Timestamp, Status> {
        self.zpush(
            &SArray::from_slice(keys),
            &SArray::from_slice(vals),
            &SArray::from_slice(lens),
            cmd,
            cb,
        )
    }

    /// Zero-copy push: shards alias the given buffers instead of copying.
    ///
    /// The caller must keep the buffer contents unchanged until the request
    /// completes.
    pub fn zpush(
        &self,
        keys: &SArray<Key>,
        vals: &SArray<V>,
        lens: &SArray<Len>,
        cmd: i32,
        cb: Option<Callback>,
    ) -> Result<Timestamp, Status> {
        let kvs = KvPairs {
            keys: keys.clone(),
            vals: vals.clone(),
            lens: lens.clone(),
        };
        let sliced = self.inner.slice(&kvs)?;
        let ts = self.customer.new_request(self.inner.po.num_servers());
        if let Some(cb) = cb {
            self.inner.add_callback(ts, Box::new(move |_| cb()));
        }
        self.inner.send_sliced(ts, true, cmd, sliced)?;
        Ok(ts)
    }

    /// Pull the values for `keys` from the owning servers.
    ///
    /// Returns immediately with the request timestamp. Once the request
    /// completes, [`wait_pull`](Self::wait_pull) hands out the merged result
    /// with value blocks in the order of `keys`.
    pub fn pull(&self, keys: &[Key], cmd: i32, cb: Option<Callback>) -> Result<Timestamp, Status> {
        self.pull_impl(SArray::from_slice(keys), None, None, cmd, cb)
    }

    /// Zero-copy pull into caller-supplied buffers.
    ///
    /// `vals` must already hold exactly the total pulled value count and
    /// `lens`, when given, one length per key; both are verified when the
    /// responses arrive. The buffers are written on the dispatcher thread.
    ///
    /// # Safety
    ///
    /// Until [`wait`](Self::wait) returns for the returned timestamp, the
    /// caller must not read, write or drop the storage behind `vals` and
    /// `lens` through any handle.
    pub unsafe fn zpull(
        &self,
        keys: &SArray<Key>,
        vals: &SArray<V>,
        lens: Option<&SArray<Len>>,
        cmd: i32,
        cb: Option<Callback>,
    ) -> Result<Timestamp, Status> {
        if vals.is_empty() {
            // The zero-copy variant cannot size the buffer after the fact.
            return Err(Status::InvalidArgument);
        }
        self.pull_impl(keys.clone(), Some(vals.clone()), lens.cloned(), cmd, cb)
    }

    fn pull_impl(
        &self,
        keys: SArray<Key>,
        dst_vals: Option<SArray<V>>,
        dst_lens: Option<SArray<Len>>,
        cmd: i32,
        cb: Option<Callback>,
    ) -> Result<Timestamp, Status> {
        let query = KvPairs {
            keys: keys.clone(),
            vals: SArray::new(),
            lens: SArray::new(),
        };
        let sliced = self.inner.slice(&query)?;
        let ts = self.customer.new_request(self.inner.po.num_servers());
        self.inner.add_callback(
            ts,
            Box::new(move |inner: &WorkerInner<V>| {
                inner.finish_pull(ts, keys, dst_vals, dst_lens, cb)
            }),
        );
        self.inner.send_sliced(ts, false, cmd, sliced)?;
        Ok(ts)
    }

    /// Block until the push or pull behind `ts` has completed.
    pub fn wait(&self, ts: Timestamp) {
        self.customer.wait_request(ts);
    }

    /// Wait for a pull issued with [`pull`](Self::pull) and take its merged
    /// result.
    ///
    /// Fails with [`Status::NotFound`] if `ts` does not name a pending pull
    /// (e.g. it was a push, a zero-copy pull, or already taken).
    pub fn wait_pull(&self, ts: Timestamp) -> Result<KvPairs<V>, Status> {
        self.wait(ts);
        self.inner
            .state
            .lock()
            .pulled
            .remove(&ts)
            .ok_or(Status::NotFound)
    }

    /// Replace the slicer function.
    ///
    /// The reassembly of pulls keeps following the policy the worker was
    /// created with; a custom slicer must shard compatibly with it.
    pub fn set_slicer(&self, slicer: SlicerFn<V>) {
        *self.inner.slicer.write() = slicer;
    }

    /// Responses received so far for `ts`.
    pub fn num_response(&self, ts: Timestamp) -> usize {
        self.customer.num_response(ts)
    }
}

impl<V: Pod + Send + Sync> WorkerInner<V> {
    fn slice(&self, kvs: &KvPairs<V>) -> Result<Sliced<V>, Status> {
        kvs.value_shape()?;
        (self.slicer.read())(kvs, self.po.server_key_ranges())
    }

    fn add_callback(&self, ts: Timestamp, cb: CompletionFn<V>) {
        self.state.lock().callbacks.insert(ts, cb);
    }

    /// Run and remove the completion for `ts`, with the lock released.
    fn run_callback(&self, ts: Timestamp) {
        let cb = self.state.lock().callbacks.remove(&ts);
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Transmit the active shards of a sliced request.
    ///
    /// Inactive shards are credited up front; if nothing is active at all
    /// the completion fires right here on the issuing thread.
    fn send_sliced(
        &self,
        ts: Timestamp,
        push: bool,
        cmd: i32,
        sliced: Sliced<V>,
    ) -> Result<(), Status> {
        let skipped = sliced.iter().filter(|(active, _)| !active).count();
        self.tracker.add_response(ts, skipped);
        if skipped == sliced.len() {
            self.run_callback(ts);
            return Ok(());
        }
        let transport = self.po.transport()?;
        for (rank, (active, shard)) in sliced.into_iter().enumerate() {
            if !active {
                continue;
            }
            let mut msg = Message::new(Meta {
                app_id: self.app_id,
                customer_id: self.customer_id,
                timestamp: ts,
                sender: self.po.node_id(),
                recver: Postoffice::server_rank_to_id(rank),
                request: true,
                push,
                cmd,
                simple_app: false,
            });
            msg.pack_kv(&shard);
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(ts, rank, keys = shard.keys.len(), push, "send shard");
            }
            transport.send(msg)?;
        }
        Ok(())
    }

    /// Inbound handler, called on the dispatcher thread.
    fn process(&self, msg: Message) {
        if msg.meta.simple_app {
            tracing::warn!(ts = msg.meta.timestamp, "simple-app message on kv worker, dropped");
            return;
        }
        let ts = msg.meta.timestamp;
        if !msg.meta.push && !msg.data.is_empty() {
            let kvs = match msg.unpack_kv::<V>() {
                Ok(kvs) => kvs,
                // A malformed response means the fan-in can never complete
                // correctly; failing the dispatcher is the only honest exit.
                Err(status) => panic!("corrupt pull response for ts {ts}: {status}"),
            };
            self.state.lock().recv_kvs.entry(ts).or_default().push(kvs);
        }
        // The credit for this message lands after this handler returns, so
        // the final response observes expected - 1 here.
        if self.tracker.num_response(ts) + 1 == self.tracker.expected(ts) {
            self.run_callback(ts);
        }
    }

    /// Merge the buffered fragments of a pull back into caller key order.
    fn finish_pull(
        &self,
        ts: Timestamp,
        keys: SArray<Key>,
        dst_vals: Option<SArray<V>>,
        dst_lens: Option<SArray<Len>>,
        cb: Option<Callback>,
    ) {
        let mut frags = self
            .state
            .lock()
            .recv_kvs
            .remove(&ts)
            .unwrap_or_default();
        let keys_cnt = keys.len();
        let num_servers = self.po.num_servers();

        // Validate that the fragments cover the request exactly once.
        let mut total_key = 0usize;
        let mut total_val = 0usize;
        match self.policy {
            SlicerPolicy::Range => {
                for frag in &frags {
                    let span = find_range(
                        keys.as_slice(),
                        frag.keys[0],
                        frag.keys[frag.keys.len() - 1] + 1,
                    );
                    assert_eq!(
                        span.len(),
                        frag.keys.len(),
                        "mismatched key count from one server (ts {ts})"
                    );
                    total_key += frag.keys.len();
                    total_val += frag.vals.len();
                }
                // Fragments may arrive in any order; line their blocks up by
                // their first key.
                frags.sort_by_key(|frag| frag.keys[0]);
            }
            SlicerPolicy::Modulo => {
                let mut per_server = vec![0usize; num_servers];
                for &key in keys.as_slice() {
                    per_server[(key % num_servers as u64) as usize] += 1;
                }
                for frag in &frags {
                    let server = (frag.keys[0] % num_servers as u64) as usize;
                    assert_eq!(
                        frag.keys.len(),
                        per_server[server],
                        "mismatched key count from one server (ts {ts})"
                    );
                    total_key += frag.keys.len();
                    total_val += frag.vals.len();
                }
            }
        }
        assert_eq!(total_key, keys_cnt, "pull fragments do not cover the request (ts {ts})");

        let have_lens = frags.iter().any(|frag| !frag.lens.is_empty());

        // Bind or allocate the destination buffers.
        let retain = dst_vals.is_none();
        let vals = match dst_vals {
            Some(vals) => {
                assert_eq!(vals.len(), total_val, "mismatched pull value buffer size");
                vals
            }
            None => SArray::zeroed(total_val),
        };
        let lens = match dst_lens {
            Some(lens) => {
                assert_eq!(lens.len(), keys_cnt, "mismatched pull length buffer size");
                Some(lens)
            }
            None if retain && have_lens => Some(SArray::zeroed(keys_cnt)),
            None => None,
        };

        match self.policy {
            SlicerPolicy::Range => {
                // Sorted fragments concatenate end-to-end.
                let mut val_off = 0usize;
                let mut len_off = 0usize;
                for frag in &frags {
                    // Safety: offsets stay within the destination sizes
                    // verified above; the zero-copy protocol keeps other
                    // handles off these buffers until wait() returns.
                    unsafe { vals.write_slice(val_off, frag.vals.as_slice()) };
                    val_off += frag.vals.len();
                    if let Some(lens) = &lens {
                        assert_eq!(
                            frag.lens.len(),
                            frag.keys.len(),
                            "server response missing lengths (ts {ts})"
                        );
                        unsafe { lens.write_slice(len_off, frag.lens.as_slice()) };
                        len_off += frag.lens.len();
                    }
                }
            }
            SlicerPolicy::Modulo => {
                // Walk the caller's keys; each key is the next unconsumed
                // entry of exactly one fragment.
                let mut next_key = vec![0usize; frags.len()];
                let mut next_val = vec![0usize; frags.len()];
                let mut val_off = 0usize;
                for (i, &key) in keys.as_slice().iter().enumerate() {
                    let mut matched = false;
                    for (j, frag) in frags.iter().enumerate() {
                        if next_key[j] >= frag.keys.len() || frag.keys[next_key[j]] != key {
                            continue;
                        }
                        let k = if frag.lens.is_empty() {
                            frag.vals.len() / frag.keys.len()
                        } else {
                            frag.lens[next_key[j]] as usize
                        };
                        let block = &frag.vals.as_slice()[next_val[j]..next_val[j] + k];
                        // Safety: see the range branch above.
                        unsafe { vals.write_slice(val_off, block) };
                        val_off += k;
                        if let Some(lens) = &lens {
                            unsafe { lens.write_slice(i, &[k as Len]) };
                        }
                        next_val[j] += k;
                        next_key[j] += 1;
                        matched = true;
                        break;
                    }
                    assert!(matched, "no matching fragment entry for key {key} (ts {ts})");
                }
            }
        }

        if retain {
            let result = KvPairs {
                keys,
                vals,
                lens: lens.unwrap_or_default(),
            };
            self.state.lock().pulled.insert(ts, result);
        }
        if let Some(cb) = cb {
            cb();
        }
    }
}
