//! Server-side request demultiplexer
//!
//! A server decodes each inbound message into a typed `(meta, batch)` pair
//! and hands it to the registered handler. The handler owns the store
//! semantics and must answer every request exactly once through
//! [`ServerHandle::response`], either synchronously or later from another
//! thread via a cloned handle.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::customer::{Customer, ResponseTracker};
use crate::kv::{KvMeta, KvPairs, Key, Len, ValueShape};
use crate::message::{Message, Meta};
use crate::post::Postoffice;
use crate::sarray::SArray;
use crate::status::Status;

/// Handler invoked for every decoded key-value request.
///
/// Runs on the server customer's dispatcher thread. It must eventually call
/// [`ServerHandle::response`] for the request, exactly once.
pub type ReqHandler<V> = Box<dyn Fn(&KvMeta, KvPairs<V>, &ServerHandle<V>) + Send>;

/// Cloneable responder for one server app.
///
/// Handlers receive a reference and may clone it to complete requests after
/// returning (deferred responses).
pub struct ServerHandle<V: Pod + Send + Sync> {
    app_id: i32,
    po: Arc<Postoffice>,
    _marker: PhantomData<fn(V)>,
}

impl<V: Pod + Send + Sync> Clone for ServerHandle<V> {
    fn clone(&self) -> Self {
        Self {
            app_id: self.app_id,
            po: self.po.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V: Pod + Send + Sync> ServerHandle<V> {
    /// Answer the request described by `req`.
    ///
    /// Push acknowledgements pass an empty batch; pull answers attach their
    /// keys, values and lengths as data segments. Returns the payload size
    /// submitted to the transport.
    pub fn response(&self, req: &KvMeta, res: &KvPairs<V>) -> Result<usize, Status> {
        let mut msg = Message::new(Meta {
            app_id: self.app_id,
            customer_id: req.customer_id,
            timestamp: req.timestamp,
            sender: self.po.node_id(),
            recver: req.sender,
            request: false,
            push: req.push,
            cmd: req.cmd,
            simple_app: false,
        });
        msg.pack_kv(res);
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                ts = req.timestamp,
                recver = req.sender,
                keys = res.keys.len(),
                "send response"
            );
        }
        self.po.transport()?.send(msg)
    }
}

/// A server node maintaining key-value pairs for one app.
pub struct KvServer<V: Pod + Send + Sync> {
    handle: ServerHandle<V>,
    #[allow(dead_code)]
    customer: Customer,
}

impl<V: Pod + Send + Sync> KvServer<V> {
    /// Register the server customer for `app_id` and start dispatching
    /// requests to `handler`.
    ///
    /// The server-side customer id equals the app id; inbound traffic of
    /// the app funnels into this one customer.
    pub fn new(app_id: i32, po: Arc<Postoffice>, handler: ReqHandler<V>) -> Result<Self, Status> {
        let handle = ServerHandle {
            app_id,
            po: po.clone(),
            _marker: PhantomData,
        };
        let recv = {
            let handle = handle.clone();
            Box::new(move |msg: Message| Self::process(msg, &handler, &handle))
        };
        let customer = Customer::new(app_id, app_id, Arc::new(ResponseTracker::new()), po, recv)?;
        Ok(Self { handle, customer })
    }

    /// A responder usable outside the handler (e.g. for warm-up traffic).
    pub fn server_handle(&self) -> ServerHandle<V> {
        self.handle.clone()
    }

    fn process(msg: Message, handler: &ReqHandler<V>, handle: &ServerHandle<V>) {
        if msg.meta.simple_app {
            // Not key-value traffic; the simple-app channel lives elsewhere.
            tracing::warn!(ts = msg.meta.timestamp, "simple-app message on kv server, dropped");
            return;
        }
        let meta = KvMeta {
            cmd: msg.meta.cmd,
            push: msg.meta.push,
            sender: msg.meta.sender,
            timestamp: msg.meta.timestamp,
            customer_id: msg.meta.customer_id,
        };
        let data = match msg.unpack_kv::<V>() {
            Ok(data) => data,
            Err(status) => {
                tracing::warn!(
                    ts = meta.timestamp,
                    sender = meta.sender,
                    %status,
                    "malformed kv request dropped"
                );
                return;
            }
        };
        handler(&meta, data, handle);
    }
}

/// Built-in summation store handle.
///
/// Pushes add element-wise into a per-key accumulator (first push fixes the
/// entry length); pulls answer with the stored entries in request key order,
/// with explicit lengths. Keys never pushed pull back as zero-length
/// entries.
pub struct KvStoreHandle<V> {
    store: Arc<Mutex<HashMap<Key, Vec<V>>>>,
}

impl<V> Clone for KvStoreHandle<V> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<V> Default for KvStoreHandle<V> {
    fn default() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V: Pod + Send + Sync + AddAssign> KvStoreHandle<V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the stored entry for `key`, if any.
    pub fn get(&self, key: Key) -> Option<Vec<V>> {
        self.store.lock().get(&key).cloned()
    }

    /// Box the request handler backed by this store.
    pub fn handler(&self) -> ReqHandler<V> {
        let store = self.store.clone();
        Box::new(move |meta, data, server| {
            let mut res = KvPairs::default();
            if meta.push {
                let shape = match data.value_shape() {
                    Ok(shape) => shape,
                    Err(status) => panic!("malformed push batch (ts {}): {status}", meta.timestamp),
                };
                let mut store = store.lock();
                let mut val_off = 0usize;
                for (i, &key) in data.keys.iter().enumerate() {
                    let k = match shape {
                        ValueShape::Uniform(k) => k,
                        ValueShape::Explicit => data.lens[i] as usize,
                    };
                    let src = &data.vals.as_slice()[val_off..val_off + k];
                    let entry = store.entry(key).or_insert_with(|| vec![V::zeroed(); k]);
                    assert_eq!(entry.len(), k, "pushed value length changed for key {key}");
                    for (acc, v) in entry.iter_mut().zip(src) {
                        *acc += *v;
                    }
                    val_off += k;
                }
            } else {
                let store = store.lock();
                let mut vals = Vec::new();
                let mut lens = Vec::new();
                for &key in data.keys.iter() {
                    match store.get(&key) {
                        Some(entry) => {
                            vals.extend_from_slice(entry);
                            lens.push(entry.len() as Len);
                        }
                        None => lens.push(0),
                    }
                }
                res.keys = data.keys.clone();
                res.vals = SArray::from(vals);
                res.lens = SArray::from(lens);
            }
            if let Err(status) = server.response(meta, &res) {
                tracing::warn!(ts = meta.timestamp, %status, "response failed");
            }
        })
    }
}
