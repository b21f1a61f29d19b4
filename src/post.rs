//! Node identity, the transport seam and per-node message routing
//!
//! Each process hosts one [`Postoffice`]: it knows the node's identity, the
//! cluster shape, the server key-range table, and the customers registered
//! on this node. Outbound traffic goes through the [`Transport`] trait; the
//! transport on the receiving side hands messages back to
//! [`Postoffice::deliver`], which enqueues them for the owning customer's
//! dispatcher thread.
//!
//! [`InprocNetwork`] is a complete in-process transport used by the tests,
//! benchmarks and demos; a socket transport plugs into the same seam.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::kv::Key;
use crate::message::Message;
use crate::range::{server_key_ranges, Range};
use crate::status::Status;

/// Identifier of a node in the cluster.
pub type NodeId = i32;

/// The role a node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues pushes and pulls.
    Worker,
    /// Owns a key range and answers requests.
    Server,
}

/// Outbound message submission.
///
/// `send` is fire-and-forget and best-effort reliable; messages for the same
/// (sender, receiver, customer) triple are delivered in send order.
pub trait Transport: Send + Sync {
    /// Submit a message for delivery; returns the payload size in bytes.
    fn send(&self, msg: Message) -> Result<usize, Status>;
}

/// Per-node registry: identity, cluster shape, key ranges and customers.
pub struct Postoffice {
    role: Role,
    rank: usize,
    node_id: NodeId,
    num_servers: usize,
    num_workers: usize,
    ranges: Vec<Range>,
    verbose: u8,
    customers: Mutex<HashMap<(i32, i32), Sender<Message>>>,
    transport: OnceLock<Arc<dyn Transport>>,
}

impl Postoffice {
    /// Create the postoffice for one node.
    ///
    /// The key-range table is derived from `num_servers` and `max_key` and
    /// is identical on every node of the cluster.
    ///
    /// # Panics
    ///
    /// Panics if `num_servers` is zero.
    pub fn new(
        role: Role,
        rank: usize,
        num_servers: usize,
        num_workers: usize,
        max_key: Key,
        verbose: u8,
    ) -> Arc<Self> {
        let node_id = match role {
            Role::Server => Self::server_rank_to_id(rank),
            Role::Worker => Self::worker_rank_to_id(rank),
        };
        Arc::new(Self {
            role,
            rank,
            node_id,
            num_servers,
            num_workers,
            ranges: server_key_ranges(num_servers, max_key),
            verbose,
            customers: Mutex::new(HashMap::new()),
            transport: OnceLock::new(),
        })
    }

    /// Node id of a server by rank (even ids starting at 8).
    #[inline]
    pub const fn server_rank_to_id(rank: usize) -> NodeId {
        8 + 2 * rank as NodeId
    }

    /// Node id of a worker by rank (odd ids starting at 9).
    #[inline]
    pub const fn worker_rank_to_id(rank: usize) -> NodeId {
        9 + 2 * rank as NodeId
    }

    /// This node's id.
    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This node's role.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// This node's rank within its role.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of servers in the cluster.
    #[inline]
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    /// Number of workers in the cluster.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Diagnostic verbosity (0..=2); no functional effect.
    #[inline]
    pub fn verbose(&self) -> u8 {
        self.verbose
    }

    /// The server key-range table, computed once at construction.
    #[inline]
    pub fn server_key_ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Bind the outbound transport; may be done once.
    pub fn bind_transport(&self, transport: Arc<dyn Transport>) -> Result<(), Status> {
        self.transport
            .set(transport)
            .map_err(|_| Status::InvalidOperation)
    }

    /// The bound transport.
    pub fn transport(&self) -> Result<&Arc<dyn Transport>, Status> {
        self.transport.get().ok_or(Status::InvalidOperation)
    }

    /// Register a customer's inbound queue. Fails if the (app, customer)
    /// slot is taken.
    pub(crate) fn register_customer(
        &self,
        app_id: i32,
        customer_id: i32,
        tx: Sender<Message>,
    ) -> Result<(), Status> {
        let mut customers = self.customers.lock();
        if customers.contains_key(&(app_id, customer_id)) {
            return Err(Status::InvalidArgument);
        }
        customers.insert((app_id, customer_id), tx);
        Ok(())
    }

    /// Remove a customer's inbound queue.
    pub(crate) fn unregister_customer(&self, app_id: i32, customer_id: i32) {
        self.customers.lock().remove(&(app_id, customer_id));
    }

    /// Route an inbound message to the owning customer's queue.
    ///
    /// On worker nodes requests are multiplexed by the customer id carried
    /// in the message; on server nodes all traffic of an app funnels into
    /// the app's single customer.
    pub fn deliver(&self, msg: Message) -> Result<(), Status> {
        let customer_id = match self.role {
            Role::Server => msg.meta.app_id,
            Role::Worker => msg.meta.customer_id,
        };
        let tx = self
            .customers
            .lock()
            .get(&(msg.meta.app_id, customer_id))
            .cloned()
            .ok_or(Status::NotFound)?;
        tx.send(msg).map_err(|_| Status::IoError)
    }
}

/// In-process transport: routes messages directly into the destination
/// node's postoffice.
#[derive(Default)]
pub struct InprocNetwork {
    nodes: Mutex<HashMap<NodeId, Arc<Postoffice>>>,
}

impl InprocNetwork {
    /// Create an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and bind this network as its transport.
    pub fn add_node(self: &Arc<Self>, po: &Arc<Postoffice>) -> Result<(), Status> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&po.node_id()) {
            return Err(Status::InvalidArgument);
        }
        nodes.insert(po.node_id(), po.clone());
        drop(nodes);
        po.bind_transport(self.clone())
    }
}

impl Transport for InprocNetwork {
    fn send(&self, msg: Message) -> Result<usize, Status> {
        let dest = self
            .nodes
            .lock()
            .get(&msg.meta.recver)
            .cloned()
            .ok_or(Status::NotFound)?;
        let bytes = msg.data_bytes();
        dest.deliver(msg)?;
        Ok(bytes)
    }
}
