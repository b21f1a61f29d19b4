//! End-to-end push/pull over an in-process three-server cluster.

mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oxiparam::post::{InprocNetwork, Postoffice, Role};
use oxiparam::sarray::SArray;
use oxiparam::server::{KvServer, KvStoreHandle, ReqHandler};
use oxiparam::slicer::SlicerPolicy;
use oxiparam::worker::KvWorker;

// Three servers owning [0,10), [10,20), [20,30); one value per key.

#[test]
fn range_push_then_pull_in_caller_order() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let ts = worker
        .push(&[2, 12, 25], &[1.0, 2.0, 3.0], &[], 0, None)
        .unwrap();
    worker.wait(ts);

    // Each server received exactly its shard.
    assert_eq!(cluster.stores[0].get(2).unwrap(), vec![1.0]);
    assert_eq!(cluster.stores[1].get(12).unwrap(), vec![2.0]);
    assert_eq!(cluster.stores[2].get(25).unwrap(), vec![3.0]);
    assert!(cluster.stores[0].get(12).is_none());

    let ts = worker.pull(&[2, 12, 25], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[1.0, 2.0, 3.0]);
}

#[test]
fn range_pull_with_reversed_fragment_arrival() {
    // Servers delay their pull answers so that server 2 responds first and
    // server 0 last; the merged result must still follow the caller order.
    let net = InprocNetwork::new();
    let mut servers = Vec::new();
    for rank in 0..3usize {
        let po = Postoffice::new(Role::Server, rank, 3, 1, 30, 0);
        net.add_node(&po).unwrap();
        let store = KvStoreHandle::<f32>::new();
        let inner = store.handler();
        let delayed: ReqHandler<f32> = Box::new(move |meta, data, server| {
            if !meta.push {
                std::thread::sleep(Duration::from_millis(30 * rank as u64));
            }
            inner(meta, data, server);
        });
        servers.push(KvServer::new(0, po, delayed).unwrap());
    }
    let worker_po = Postoffice::new(Role::Worker, 0, 3, 1, 30, 0);
    net.add_node(&worker_po).unwrap();
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, worker_po).unwrap();

    let ts = worker
        .push(&[2, 12, 25], &[1.0, 2.0, 3.0], &[], 0, None)
        .unwrap();
    worker.wait(ts);

    let ts = worker.pull(&[2, 12, 25], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[1.0, 2.0, 3.0]);
}

#[test]
fn modulo_push_then_pull_in_caller_order() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Modulo, cluster.worker_po.clone()).unwrap();

    let ts = worker
        .push(&[1, 2, 3, 4, 5], &[10.0, 20.0, 30.0, 40.0, 50.0], &[], 0, None)
        .unwrap();
    worker.wait(ts);

    // Residue routing: server 1 got {1, 4}, server 2 got {2, 5}, server 0
    // got {3}.
    assert_eq!(cluster.stores[1].get(1).unwrap(), vec![10.0]);
    assert_eq!(cluster.stores[1].get(4).unwrap(), vec![40.0]);
    assert_eq!(cluster.stores[2].get(2).unwrap(), vec![20.0]);
    assert_eq!(cluster.stores[2].get(5).unwrap(), vec![50.0]);
    assert_eq!(cluster.stores[0].get(3).unwrap(), vec![30.0]);

    let ts = worker.pull(&[1, 2, 3, 4, 5], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[10.0, 20.0, 30.0, 40.0, 50.0]);
}

#[test]
fn variable_length_values_range() {
    let cluster = util::cluster::<i32>(2, 20);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let ts = worker
        .push(&[5, 15], &[1, 2, 3, 7, 8], &[3, 2], 0, None)
        .unwrap();
    worker.wait(ts);
    assert_eq!(cluster.stores[0].get(5).unwrap(), vec![1, 2, 3]);
    assert_eq!(cluster.stores[1].get(15).unwrap(), vec![7, 8]);

    let ts = worker.pull(&[5, 15], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[1, 2, 3, 7, 8]);
    assert_eq!(out.lens.as_slice(), &[3, 2]);
}

#[test]
fn zero_length_entry_is_preserved_positionally() {
    let cluster = util::cluster::<i32>(2, 20);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let ts = worker
        .push(&[3, 7, 15], &[1, 2, 9], &[2, 0, 1], 0, None)
        .unwrap();
    worker.wait(ts);

    let ts = worker.pull(&[3, 7, 15], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[1, 2, 9]);
    assert_eq!(out.lens.as_slice(), &[2, 0, 1]);
}

#[test]
fn empty_push_completes_immediately() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker = KvWorker::<f32>::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let flag = fired.clone();
    let ts = worker
        .push(
            &[],
            &[],
            &[],
            0,
            Some(Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    worker.wait(ts);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn single_server_gets_one_shard() {
    let cluster = util::cluster::<f32>(1, 100);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let ts = worker
        .push(&[0, 42, 99], &[1.0, 2.0, 3.0], &[], 0, None)
        .unwrap();
    worker.wait(ts);
    assert_eq!(cluster.stores[0].get(42).unwrap(), vec![2.0]);

    let ts = worker.pull(&[0, 42, 99], 0, None).unwrap();
    let out = worker.wait_pull(ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[1.0, 2.0, 3.0]);
}

#[test]
fn zero_copy_push_and_pull() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let keys = SArray::from_slice(&[2u64, 12, 25]);
    let vals = SArray::from_slice(&[4.0f32, 5.0, 6.0]);
    let lens: SArray<i32> = SArray::new();
    let ts = worker.zpush(&keys, &vals, &lens, 0, None).unwrap();
    worker.wait(ts);

    let out_vals: SArray<f32> = SArray::zeroed(3);
    let out_lens: SArray<i32> = SArray::zeroed(3);
    // Safety: the output buffers are not touched until wait() returns.
    let ts = unsafe { worker.zpull(&keys, &out_vals, Some(&out_lens), 0, None) }.unwrap();
    worker.wait(ts);
    assert_eq!(out_vals.as_slice(), &[4.0, 5.0, 6.0]);
    assert_eq!(out_lens.as_slice(), &[1, 1, 1]);
}

#[test]
fn callbacks_fire_exactly_once_per_timestamp() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker = KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let mut timestamps = Vec::new();
    for round in 0..50u64 {
        // Batches touch one, two or three servers depending on the round.
        let keys: Vec<u64> = (0..=(round % 3)).map(|s| s * 10 + round % 10).collect();
        let vals = vec![1.0f32; keys.len()];
        let flag = fired.clone();
        let ts = worker
            .push(
                &keys,
                &vals,
                &[],
                0,
                Some(Box::new(move || {
                    flag.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        timestamps.push(ts);
    }
    for ts in timestamps {
        worker.wait(ts);
    }
    assert_eq!(fired.load(Ordering::SeqCst), 50);
}

#[test]
fn reentrant_pull_from_push_callback() {
    let cluster = util::cluster::<f32>(3, 30);
    let worker =
        Arc::new(KvWorker::new(0, 0, SlicerPolicy::Range, cluster.worker_po.clone()).unwrap());

    let ts = worker.push(&[2, 12], &[1.0, 2.0], &[], 0, None).unwrap();
    worker.wait(ts);

    let (tx, rx) = crossbeam::channel::bounded(1);
    let inner = worker.clone();
    let ts = worker
        .push(
            &[2],
            &[1.0],
            &[],
            0,
            Some(Box::new(move || {
                // Issue a follow-up pull from inside the completion callback.
                let ts = inner.pull(&[2, 12], 0, None).unwrap();
                tx.send(ts).unwrap();
            })),
        )
        .unwrap();
    worker.wait(ts);
    let pull_ts = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let out = worker.wait_pull(pull_ts).unwrap();
    assert_eq!(out.vals.as_slice(), &[2.0, 2.0]);
}
