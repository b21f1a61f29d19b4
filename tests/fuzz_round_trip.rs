//! Randomized push/pull round trips validated against an in-memory model.

mod util;

use std::collections::HashMap;

use oxiparam::slicer::SlicerPolicy;
use oxiparam::worker::KvWorker;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const KEY_SPACE: u64 = 300;
const ROUNDS: usize = 30;

/// Per-key value length used by the variable-length runs; includes zero.
fn var_len(key: u64) -> usize {
    (key % 3) as usize
}

fn run_uniform(policy: SlicerPolicy, k: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let cluster = util::cluster::<f32>(3, KEY_SPACE);
    let worker = KvWorker::new(0, 0, policy, cluster.worker_po.clone()).unwrap();
    let mut model: HashMap<u64, Vec<f32>> = HashMap::new();

    for _ in 0..ROUNDS {
        let mut keys: Vec<u64> = (0..KEY_SPACE).filter(|_| rng.gen_bool(0.1)).collect();
        if keys.is_empty() {
            continue;
        }
        if policy == SlicerPolicy::Modulo {
            // The modulo policy accepts unsorted batches.
            keys.shuffle(&mut rng);
        }
        let mut vals: Vec<f32> = Vec::with_capacity(keys.len() * k);
        for _ in keys.iter() {
            for _ in 0..k {
                vals.push(rng.gen_range(0..100) as f32);
            }
        }

        let ts = worker.push(&keys, &vals, &[], 0, None).unwrap();
        worker.wait(ts);
        for (i, &key) in keys.iter().enumerate() {
            let entry = model.entry(key).or_insert_with(|| vec![0.0; k]);
            for j in 0..k {
                entry[j] += vals[i * k + j];
            }
        }

        // Pull a random subset of the keys pushed so far.
        let mut pull_keys: Vec<u64> = model.keys().copied().filter(|_| rng.gen_bool(0.5)).collect();
        pull_keys.sort_unstable();
        if policy == SlicerPolicy::Modulo {
            pull_keys.shuffle(&mut rng);
        }
        if pull_keys.is_empty() {
            continue;
        }
        let ts = worker.pull(&pull_keys, 0, None).unwrap();
        let out = worker.wait_pull(ts).unwrap();

        let expected: Vec<f32> = pull_keys
            .iter()
            .flat_map(|key| model[key].iter().copied())
            .collect();
        assert_eq!(out.vals.as_slice(), expected.as_slice(), "policy {policy:?}");
    }
}

fn run_varlen(policy: SlicerPolicy, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let cluster = util::cluster::<f32>(3, KEY_SPACE);
    let worker = KvWorker::new(0, 0, policy, cluster.worker_po.clone()).unwrap();
    let mut model: HashMap<u64, Vec<f32>> = HashMap::new();

    for _ in 0..ROUNDS {
        let mut keys: Vec<u64> = (0..KEY_SPACE).filter(|_| rng.gen_bool(0.1)).collect();
        if keys.is_empty() {
            continue;
        }
        if policy == SlicerPolicy::Modulo {
            keys.shuffle(&mut rng);
        }
        let lens: Vec<i32> = keys.iter().map(|&key| var_len(key) as i32).collect();
        let mut vals: Vec<f32> = Vec::new();
        for &key in keys.iter() {
            for _ in 0..var_len(key) {
                vals.push(rng.gen_range(0..100) as f32);
            }
        }

        let ts = worker.push(&keys, &vals, &lens, 0, None).unwrap();
        worker.wait(ts);
        let mut off = 0usize;
        for &key in &keys {
            let len = var_len(key);
            let entry = model.entry(key).or_insert_with(|| vec![0.0; len]);
            for j in 0..len {
                entry[j] += vals[off + j];
            }
            off += len;
        }

        let mut pull_keys: Vec<u64> = model.keys().copied().filter(|_| rng.gen_bool(0.5)).collect();
        pull_keys.sort_unstable();
        if policy == SlicerPolicy::Modulo {
            pull_keys.shuffle(&mut rng);
        }
        if pull_keys.is_empty() {
            continue;
        }
        let ts = worker.pull(&pull_keys, 0, None).unwrap();
        let out = worker.wait_pull(ts).unwrap();

        let expected_vals: Vec<f32> = pull_keys
            .iter()
            .flat_map(|key| model[key].iter().copied())
            .collect();
        let expected_lens: Vec<i32> = pull_keys.iter().map(|&key| var_len(key) as i32).collect();
        assert_eq!(out.vals.as_slice(), expected_vals.as_slice());
        assert_eq!(out.lens.as_slice(), expected_lens.as_slice());
    }
}

#[test]
fn uniform_range() {
    run_uniform(SlicerPolicy::Range, 1, 0xA11CE);
    run_uniform(SlicerPolicy::Range, 4, 0xB0B);
}

#[test]
fn uniform_modulo() {
    run_uniform(SlicerPolicy::Modulo, 1, 0xC0FFEE);
    run_uniform(SlicerPolicy::Modulo, 3, 0xDEED);
}

#[test]
fn varlen_range() {
    run_varlen(SlicerPolicy::Range, 0xFEED);
}

#[test]
fn varlen_modulo() {
    run_varlen(SlicerPolicy::Modulo, 0xBEEF);
}
