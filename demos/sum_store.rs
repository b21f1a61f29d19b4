//! End-to-end demo: a three-server summation store in one process.
//!
//! Run: cargo run --example sum_store
//!
//! Configuration is read the usual way, e.g.
//! `OXIPARAM__node__slicer=modulo cargo run --example sum_store`.

use std::sync::Arc;

use oxiparam::config::{ClusterConfig, OxiparamConfig};
use oxiparam::post::{InprocNetwork, Postoffice, Role};
use oxiparam::server::{KvServer, KvStoreHandle};
use oxiparam::worker::KvWorker;

fn main() {
    let mut config = OxiparamConfig::load_from_env().expect("load config");
    if config.cluster.is_none() {
        config.cluster = Some(ClusterConfig {
            num_servers: Some(3),
            num_workers: Some(1),
            max_key: Some(30),
        });
    }

    // The configured verbosity selects the subscriber's max level; the
    // library's debug sites are behind tracing::enabled! guards.
    let level = match config.verbose() {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let policy = config.slicer_policy().expect("slicer policy");
    let num_servers = config.num_servers();
    let max_key = config.max_key();
    println!("cluster: {num_servers} servers, key space [0, {max_key}), {policy:?} slicer");

    let net = InprocNetwork::new();
    let mut servers = Vec::new();
    let mut stores = Vec::new();
    for rank in 0..num_servers {
        let po = Postoffice::new(Role::Server, rank, num_servers, 1, max_key, config.verbose());
        net.add_node(&po).unwrap();
        let store = KvStoreHandle::<f32>::new();
        servers.push(KvServer::new(0, po, store.handler()).unwrap());
        stores.push(store);
    }
    let worker_po = Postoffice::new(
        Role::Worker,
        0,
        num_servers,
        1,
        max_key,
        config.verbose(),
    );
    net.add_node(&worker_po).unwrap();
    let worker = Arc::new(KvWorker::<f32>::new(0, 0, policy, worker_po).unwrap());

    // Push twice, pull once: the store sums element-wise.
    let keys = [2u64, 12, 25];
    let vals = [1.0f32, 2.0, 3.0];
    for round in 0..2 {
        let ts = worker.push(&keys, &vals, &[], 0, None).unwrap();
        worker.wait(ts);
        println!("push #{round} done");
    }

    let ts = worker.pull(&keys, 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    println!("pulled {:?} -> {:?}", keys, out.vals.as_slice());
    assert_eq!(out.vals.as_slice(), &[2.0, 4.0, 6.0]);

    // Fire a burst of asynchronous pushes and wait for all of them at once.
    let timestamps: Vec<_> = (0..8)
        .map(|_| worker.push(&keys, &vals, &[], 0, None).unwrap())
        .collect();
    for ts in timestamps {
        worker.wait(ts);
    }
    let ts = worker.pull(&keys, 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    println!("after burst -> {:?}", out.vals.as_slice());

    for (rank, store) in stores.iter().enumerate() {
        let held = (0..max_key).filter(|&k| store.get(k).is_some()).count();
        println!("server {rank} holds {held} key(s)");
    }
    drop(servers);
}
