//! Sharing one precomputed table across independently loaded indexes.
//!
//! IVF16, PQ 8x4, 1000 random 32-d vectors. Each index is saved, loaded once
//! normally (the loader builds and owns its table) and once with
//! `SKIP_PRECOMPUTE_TABLE` (the caller attaches a table it built itself). Both
//! must return identical results.

use ivfpq_share::ivf_pq::{build_precomputed_table, CodeLayout, FastScan, Standard};
use ivfpq_share::persistence::{
    read_index, read_precomputed_table, write_index, write_precomputed_table, FsDirectory,
    IndexType, IoFlags, LoadedIndex, MemoryDirectory,
};
use ivfpq_share::{IVFPQIndex, IVFPQParams, MetricType, RetrieveError, UsageMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const D: usize = 32;
const NB: usize = 1000;
const NQ: usize = 1000;
const K: usize = 10;

fn random_vectors(n: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n * D).map(|_| rng.random::<f32>()).collect()
}

fn params(metric: MetricType) -> IVFPQParams {
    IVFPQParams::new(16, 8, 4)
        .with_metric(metric)
        .with_nprobe(4)
        .with_seed(1234)
}

/// Train, fill and save an index; return the directory holding it.
fn save_index<L: CodeLayout>(metric: MetricType) -> TempDir {
    let data = random_vectors(NB, 42);
    let mut index = IVFPQIndex::<L>::new(D, params(metric)).expect("create");
    index.train(&data, NB).expect("train");
    index.add(&data).expect("add");

    let tmp = TempDir::new().expect("tempdir");
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");
    write_index(&index, &dir).expect("write");
    tmp
}

fn expected_mode(metric: MetricType) -> UsageMode {
    match metric {
        MetricType::L2 => UsageMode::PerList,
        MetricType::InnerProduct => UsageMode::Unused,
    }
}

fn assert_same_results(a: &[Vec<(u32, f32)>], b: &[Vec<(u32, f32)>]) {
    assert_eq!(a.len(), b.len());
    for (ra, rb) in a.iter().zip(b) {
        let labels_a: Vec<u32> = ra.iter().map(|&(id, _)| id).collect();
        let labels_b: Vec<u32> = rb.iter().map(|&(id, _)| id).collect();
        assert_eq!(labels_a, labels_b);
        for (&(_, da), &(_, db)) in ra.iter().zip(rb) {
            assert!((da - db).abs() <= 1e-6, "{da} vs {db}");
        }
    }
}

fn check_sharing<L: CodeLayout>(metric: MetricType) {
    let tmp = save_index::<L>(metric);
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");
    let queries = random_vectors(NQ, 7);

    // Normal load: the index builds and owns its table.
    let owner = read_index(&dir, IoFlags::NONE).expect("read");
    assert_eq!(owner.index_type(), L::INDEX_TYPE);
    assert!(owner.owns_precomputed_table());
    assert_eq!(owner.use_precomputed_table(), expected_mode(metric));

    // Skip load: no table until one is attached.
    let mut borrower = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE).expect("read");
    assert_eq!(borrower.use_precomputed_table(), UsageMode::Unused);
    assert!(borrower.precomputed_table().is_none());
    assert!(!borrower.owns_precomputed_table());

    let (mode, table) = borrower.build_precomputed_table().expect("build table");
    assert_eq!(mode, expected_mode(metric));
    borrower.set_precomputed_table(&table, mode).expect("attach");
    assert!(!borrower.owns_precomputed_table());
    assert_eq!(borrower.use_precomputed_table(), expected_mode(metric));

    let expected = owner.search_batch(&queries, NQ, K).expect("search");
    let got = borrower.search_batch(&queries, NQ, K).expect("search");
    assert!(expected.iter().all(|r| r.len() == K));
    assert_same_results(&expected, &got);
}

#[test]
fn shared_table_l2_standard() {
    check_sharing::<Standard>(MetricType::L2);
}

#[test]
fn shared_table_l2_fast_scan() {
    check_sharing::<FastScan>(MetricType::L2);
}

#[test]
fn shared_table_inner_product_standard() {
    check_sharing::<Standard>(MetricType::InnerProduct);
}

#[test]
fn shared_table_inner_product_fast_scan() {
    check_sharing::<FastScan>(MetricType::InnerProduct);
}

#[test]
fn table_outlives_dropped_borrower() {
    let tmp = save_index::<Standard>(MetricType::L2);
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");
    let queries = random_vectors(50, 11);

    let mut first = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE).expect("read");
    let mut second = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE).expect("read");
    let (mode, table) = first.build_precomputed_table().expect("build table");
    first.set_precomputed_table(&table, mode).expect("attach");
    second.set_precomputed_table(&table, mode).expect("attach");

    let before = second.search_batch(&queries, 50, K).expect("search");
    drop(first);
    let after = second.search_batch(&queries, 50, K).expect("search");
    assert_same_results(&before, &after);
    assert_eq!(second.precomputed_table(), Some(&table));
}

#[test]
fn borrowers_search_concurrently() {
    let tmp = save_index::<FastScan>(MetricType::L2);
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");
    let queries = random_vectors(200, 13);

    let reference = read_index(&dir, IoFlags::NONE).expect("read");
    let expected = reference.search_batch(&queries, 200, K).expect("search");

    let (mode, table) = reference.build_precomputed_table().expect("build table");
    let mut replicas: Vec<LoadedIndex<'_>> = (0..4)
        .map(|_| read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE | IoFlags::READ_ONLY))
        .collect::<Result<_, _>>()
        .expect("read");
    for replica in &mut replicas {
        replica.set_precomputed_table(&table, mode).expect("attach");
    }

    let queries = &queries;
    std::thread::scope(|s| {
        let handles: Vec<_> = replicas
            .iter()
            .map(|replica| s.spawn(move || replica.search_batch(queries, 200, K)))
            .collect();
        for handle in handles {
            let got = handle.join().expect("thread").expect("search");
            assert_same_results(&expected, &got);
        }
    });
}

#[test]
fn table_file_can_be_shared_between_processes() {
    let tmp = save_index::<Standard>(MetricType::L2);
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");
    let queries = random_vectors(100, 17);

    let owner = read_index(&dir, IoFlags::NONE).expect("read");
    let built = owner.precomputed_table().expect("table").clone();
    write_precomputed_table(&dir, "shared/table.bin", &built).expect("write table");

    let table = read_precomputed_table(&dir, "shared/table.bin").expect("read table");
    assert_eq!(table, built);

    let mut borrower = read_index(&dir, IoFlags::SKIP_PRECOMPUTE_TABLE).expect("read");
    borrower
        .set_precomputed_table(&table, UsageMode::PerList)
        .expect("attach");
    assert_same_results(
        &owner.search_batch(&queries, 100, K).expect("search"),
        &borrower.search_batch(&queries, 100, K).expect("search"),
    );
}

#[test]
fn read_only_replica_rejects_inserts() {
    let tmp = save_index::<Standard>(MetricType::L2);
    let dir = FsDirectory::new(tmp.path()).expect("fs directory");

    let mut index = read_index(&dir, IoFlags::READ_ONLY).expect("read");
    assert!(index.owns_precomputed_table());
    let err = index.add(&random_vectors(1, 3)).unwrap_err();
    assert!(matches!(err, RetrieveError::InvalidState(_)));

    let mut writable = read_index(&dir, IoFlags::NONE).expect("read");
    writable.add(&random_vectors(1, 3)).expect("add");
    assert_eq!(writable.ntotal(), NB + 1);
}

#[test]
fn attaching_replaces_owned_table() {
    let data = random_vectors(NB, 42);
    let mut index = IVFPQIndex::<Standard>::new(D, params(MetricType::L2)).expect("create");
    index.train(&data, NB).expect("train");
    index.add(&data).expect("add");
    assert!(index.owns_precomputed_table());

    let (mode, table) =
        build_precomputed_table(index.quantizer(), index.pq(), true, false).expect("build");
    index.set_precomputed_table(&table, mode).expect("attach");
    assert!(!index.owns_precomputed_table());

    // Rebuilding takes ownership again.
    index.precompute_table().expect("rebuild");
    assert!(index.owns_precomputed_table());
    assert_eq!(index.precomputed_table(), Some(&table));
}

#[test]
fn memory_directory_round_trip() {
    let data = random_vectors(NB, 42);
    let mut index = IVFPQIndex::<FastScan>::new(D, params(MetricType::L2)).expect("create");
    index.train(&data, NB).expect("train");
    index.add(&data).expect("add");

    let mem = MemoryDirectory::new();
    write_index(&index, &mem).expect("write");
    let loaded = read_index(&mem, IoFlags::NONE).expect("read");
    assert_eq!(loaded.index_type(), IndexType::IvfPqFastScan);
    assert!(loaded.as_fast_scan().is_some());
    assert!(loaded.as_standard().is_none());

    let queries = random_vectors(20, 5);
    assert_same_results(
        &index.search_batch(&queries, 20, K).expect("search"),
        &loaded.search_batch(&queries, 20, K).expect("search"),
    );
}
