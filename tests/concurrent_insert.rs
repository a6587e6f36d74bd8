//! Integration tests for concurrent insert, search and delete.
//!
//! These tests verify that the graph stays structurally valid and searchable
//! while many threads mutate it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use ndarray::Array2;
use next_plaid_ann::{HnswIndex, IndexConfig, Label, Space};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const DIM: usize = 12;

fn random_vectors(n: usize, dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::from_shape_fn((n, dim), |_| rng.gen::<f32>())
}

fn self_recall(index: &HnswIndex, data: &Array2<f32>) -> f64 {
    let results = index.batch_search(data.view(), 1).unwrap();
    let hits = results
        .iter()
        .enumerate()
        .filter(|(i, r)| r.first().map(|h| h.label) == Some(*i as Label))
        .count();
    hits as f64 / data.nrows() as f64
}

fn config() -> IndexConfig {
    IndexConfig::with_m(12).ef_construction(80).ef_search(64).seed(3)
}

#[test]
fn test_threads_insert_disjoint_ranges() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 1_000;
    let n = THREADS * PER_THREAD;
    let data = Arc::new(random_vectors(n, DIM, 1));
    let index = Arc::new(HnswIndex::new(Space::L2, DIM, n, config()).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let index = Arc::clone(&index);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                for i in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                    let row = data.row(i);
                    index.insert(row.as_slice().unwrap(), i as Label).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.len(), n);
    index.check_integrity().unwrap();

    let sequential = HnswIndex::new(Space::L2, DIM, n, config()).unwrap();
    for (i, row) in data.outer_iter().enumerate() {
        sequential.insert(row.as_slice().unwrap(), i as Label).unwrap();
    }

    let concurrent_recall = self_recall(&index, &data);
    let sequential_recall = self_recall(&sequential, &data);
    assert!(concurrent_recall >= 0.99, "concurrent recall {}", concurrent_recall);
    assert!(
        (concurrent_recall - sequential_recall).abs() < 0.01,
        "concurrent {} vs sequential {}",
        concurrent_recall,
        sequential_recall
    );
}

#[test]
fn test_search_and_delete_during_inserts() {
    let n = 3_000;
    let data = Arc::new(random_vectors(n, DIM, 2));
    let index = Arc::new(HnswIndex::new(Space::L2, DIM, n, config()).unwrap());

    // Seed the graph so readers always have something to find.
    for i in 0..200 {
        index.insert(data.row(i).as_slice().unwrap(), i as Label).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let index = Arc::clone(&index);
        let data = Arc::clone(&data);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let labels: Vec<Label> = (200..n as Label).collect();
            index
                .batch_insert(data.slice(ndarray::s![200.., ..]), &labels)
                .unwrap();
            done.store(true, Ordering::Release);
        })
    };

    let reader = {
        let index = Arc::clone(&index);
        let data = Arc::clone(&data);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut searches = 0usize;
            while !done.load(Ordering::Acquire) || searches < 100 {
                let q = data.row(searches % 200);
                let results = index.search(q.as_slice().unwrap(), 5).unwrap();
                assert!(!results.is_empty());
                for pair in results.windows(2) {
                    assert!(pair[0].distance <= pair[1].distance);
                }
                searches += 1;
            }
        })
    };

    let deleter = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for label in (0..200).step_by(2) {
                index.mark_deleted(label).unwrap();
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    deleter.join().unwrap();

    assert_eq!(index.len(), n);
    assert_eq!(index.live_len(), n - 100);
    index.check_integrity().unwrap();

    for i in (0..200).step_by(2) {
        let results = index.search(data.row(i).as_slice().unwrap(), 10).unwrap();
        assert!(results.iter().all(|r| r.label != i as Label));
    }
}

#[test]
fn test_duplicate_labels_across_threads() {
    let data = Arc::new(random_vectors(64, DIM, 4));
    let index = Arc::new(HnswIndex::new(Space::L2, DIM, 256, config()).unwrap());

    // Every thread tries every label: exactly one insert per label wins.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let index = Arc::clone(&index);
            let data = Arc::clone(&data);
            thread::spawn(move || {
                (0..64)
                    .filter(|&i| {
                        index
                            .insert(data.row(i).as_slice().unwrap(), i as Label)
                            .is_ok()
                    })
                    .count()
            })
        })
        .collect();
    let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(inserted, 64);
    assert_eq!(index.len(), 64);
    index.check_integrity().unwrap();
}
