//! Request bookkeeping and the per-customer dispatcher thread
//!
//! A customer owns the request timestamps of one worker or server instance:
//! it allocates them, counts per-timestamp responses, and wakes waiters when
//! a fan-in completes. Inbound messages are enqueued by the transport and
//! drained FIFO by exactly one dispatcher thread per customer, which calls
//! the owner's handler and then credits the response.
//!
//! Ordering matters: the handler runs before the credit, so while handling
//! the final response of a timestamp, `num_response(ts)` still reads
//! `expected - 1`. The worker keys its completion callback off exactly that
//! observation; `wait_request` returns once the credit lands.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver};
use parking_lot::{Condvar, Mutex};

use crate::kv::Timestamp;
use crate::message::Message;
use crate::post::Postoffice;
use crate::status::Status;

/// Handler invoked by the dispatcher thread for every inbound message.
pub type RecvHandle = Box<dyn Fn(Message) + Send>;

#[derive(Debug, Clone, Copy)]
struct TrackerEntry {
    expected: usize,
    received: usize,
}

/// Allocates timestamps and counts responses per timestamp.
///
/// Timestamps are dense indices into an append-only vector, so they are
/// strictly increasing and never reused within one customer.
#[derive(Default)]
pub struct ResponseTracker {
    entries: Mutex<Vec<TrackerEntry>>,
    cond: Condvar,
}

impl ResponseTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh timestamp expecting `expected` responses.
    pub fn new_request(&self, expected: usize) -> Timestamp {
        let mut entries = self.entries.lock();
        entries.push(TrackerEntry {
            expected,
            received: 0,
        });
        (entries.len() - 1) as Timestamp
    }

    /// Credit `n` responses to `ts` and wake any waiter.
    ///
    /// Used both by the dispatcher for arriving responses and by the send
    /// path to pre-credit shards that were never transmitted.
    pub fn add_response(&self, ts: Timestamp, n: usize) {
        let mut entries = self.entries.lock();
        let entry = &mut entries[ts as usize];
        entry.received += n;
        debug_assert!(entry.received <= entry.expected);
        self.cond.notify_all();
    }

    /// Responses credited to `ts` so far.
    pub fn num_response(&self, ts: Timestamp) -> usize {
        self.entries.lock()[ts as usize].received
    }

    /// Responses expected for `ts`.
    pub fn expected(&self, ts: Timestamp) -> usize {
        self.entries.lock()[ts as usize].expected
    }

    /// Block until every expected response for `ts` has been credited.
    pub fn wait(&self, ts: Timestamp) {
        let mut entries = self.entries.lock();
        while entries[ts as usize].received < entries[ts as usize].expected {
            self.cond.wait(&mut entries);
        }
    }
}

/// Request bookkeeper of one worker or server instance.
///
/// Owns the inbound queue registration and the dispatcher thread; dropping
/// the customer unregisters it, drains the queue and joins the thread.
pub struct Customer {
    app_id: i32,
    customer_id: i32,
    tracker: Arc<ResponseTracker>,
    po: Arc<Postoffice>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Customer {
    /// Register the customer and start its dispatcher thread.
    ///
    /// The tracker is passed in so the owner's handler can consult response
    /// counts for messages it is currently handling.
    pub fn new(
        app_id: i32,
        customer_id: i32,
        tracker: Arc<ResponseTracker>,
        po: Arc<Postoffice>,
        handle: RecvHandle,
    ) -> Result<Self, Status> {
        let (tx, rx) = unbounded();
        po.register_customer(app_id, customer_id, tx)?;
        let thread_tracker = tracker.clone();
        let dispatcher = thread::Builder::new()
            .name(format!("dispatcher-{app_id}-{customer_id}"))
            .spawn(move || Self::dispatch(rx, handle, thread_tracker));
        let dispatcher = match dispatcher {
            Ok(t) => t,
            Err(err) => {
                po.unregister_customer(app_id, customer_id);
                tracing::warn!(app_id, customer_id, error = %err, "failed to spawn dispatcher");
                return Err(Status::IoError);
            }
        };
        Ok(Self {
            app_id,
            customer_id,
            tracker,
            po,
            dispatcher: Some(dispatcher),
        })
    }

    fn dispatch(rx: Receiver<Message>, handle: RecvHandle, tracker: Arc<ResponseTracker>) {
        // Exits when every sender (the postoffice registration) is gone.
        for msg in rx.iter() {
            let ts = msg.meta.timestamp;
            let request = msg.meta.request;
            handle(msg);
            if !request {
                tracker.add_response(ts, 1);
            }
        }
    }

    /// Application id this customer belongs to.
    #[inline]
    pub fn app_id(&self) -> i32 {
        self.app_id
    }

    /// Customer id, unique per node within the app.
    #[inline]
    pub fn customer_id(&self) -> i32 {
        self.customer_id
    }

    /// The shared response tracker.
    #[inline]
    pub fn tracker(&self) -> &Arc<ResponseTracker> {
        &self.tracker
    }

    /// Allocate a fresh timestamp expecting `expected` responses.
    pub fn new_request(&self, expected: usize) -> Timestamp {
        self.tracker.new_request(expected)
    }

    /// Block until the fan-in for `ts` completes.
    pub fn wait_request(&self, ts: Timestamp) {
        self.tracker.wait(ts);
    }

    /// Responses credited to `ts` so far.
    pub fn num_response(&self, ts: Timestamp) -> usize {
        self.tracker.num_response(ts)
    }
}

impl Drop for Customer {
    fn drop(&mut self) {
        self.po.unregister_customer(self.app_id, self.customer_id);
        if let Some(thread) = self.dispatcher.take() {
            let _ = thread.join();
        }
    }
}
