//! Shared helpers for integration tests: an in-process cluster of summation
//! servers plus one worker postoffice.

use std::ops::AddAssign;
use std::sync::Arc;

use bytemuck::Pod;
use oxiparam::post::{InprocNetwork, Postoffice, Role};
use oxiparam::server::{KvServer, KvStoreHandle};

/// A running in-process cluster; dropping it shuts the servers down.
pub struct Cluster<V: Pod + Send + Sync> {
    #[allow(dead_code)]
    pub net: Arc<InprocNetwork>,
    pub worker_po: Arc<Postoffice>,
    pub stores: Vec<KvStoreHandle<V>>,
    #[allow(dead_code)]
    servers: Vec<KvServer<V>>,
}

/// Spin up `num_servers` summation servers and one worker postoffice over
/// an in-process network with key space `[0, max_key)`.
pub fn cluster<V>(num_servers: usize, max_key: u64) -> Cluster<V>
where
    V: Pod + Send + Sync + AddAssign + 'static,
{
    let net = InprocNetwork::new();
    let mut stores = Vec::new();
    let mut servers = Vec::new();
    for rank in 0..num_servers {
        let po = Postoffice::new(Role::Server, rank, num_servers, 1, max_key, 0);
        net.add_node(&po).unwrap();
        let store = KvStoreHandle::<V>::new();
        servers.push(KvServer::new(0, po, store.handler()).unwrap());
        stores.push(store);
    }
    let worker_po = Postoffice::new(Role::Worker, 0, num_servers, 1, max_key, 0);
    net.add_node(&worker_po).unwrap();
    Cluster {
        net,
        worker_po,
        stores,
        servers,
    }
}
