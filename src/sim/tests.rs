use std::sync::Arc;

use toml::Value;

use crate::forest::MergeForest;
use crate::gamma::Gamma;
use crate::matrix::csr::{spgemm_symbolic_phase, CsrMatrix};
use crate::matrix::data::MatrixData;

fn gamma_config() -> Value {
    "
    arch = \"gamma\"
    [mem]
    latency = 20
    bandwidth = 128
    [PE_manager]
    num_PEs = 2
    PE_radix = 4
    [fiber_cache]
    size = 24576
    num_banks = 2
    assoc = 4
    num_mem_ports = 2
    "
    .parse()
    .expect("config parses")
}

fn forest_config() -> Value {
    "
    arch = \"my_arch\"
    [mem]
    latency = 20
    bandwidth = 128
    [merge_tree_manager]
    num_merge_trees = 2
    merge_tree_size = 2
    merge_tree_merger_width = 4
    num_final_mergers = 1
    final_merger_width = 4
    num_mem_ports = 2
    [linked_list_cache]
    size = 98304
    num_mem_ports = 2
    max_fetched_rows = 16
    max_active_rows = 64
    max_inactive_rows = 64
    inactive_rows_assoc = 4
    "
    .parse()
    .expect("config parses")
}

fn diag(values: &[f64]) -> Arc<CsrMatrix> {
    let coo = values
        .iter()
        .enumerate()
        .map(|(i, &v)| (i as u32, i as u32, v))
        .collect();
    Arc::new(CsrMatrix::from_coo(
        values.len() as u32,
        values.len() as u32,
        coo,
    ))
}

fn run_gamma(a: Arc<CsrMatrix>, b: Arc<CsrMatrix>, config: &Value) -> (MatrixData, Gamma) {
    let mut mat = MatrixData::new(a, b, true).expect("preprocessing");
    let mut gamma = Gamma::new(config, &mat).expect("gamma setup");
    let mut sink = Vec::new();
    let correct = gamma
        .run_simulation(&mut mat, &mut sink)
        .expect("simulation");
    assert!(correct, "result check failed");
    (mat, gamma)
}

fn run_forest(a: Arc<CsrMatrix>, b: Arc<CsrMatrix>, config: &Value) -> (MatrixData, MergeForest) {
    let mut mat = MatrixData::new(a, b, true).expect("preprocessing");
    let mut forest = MergeForest::new(config, &mat).expect("forest setup");
    let mut sink = Vec::new();
    let correct = forest
        .run_simulation(&mut mat, &mut sink)
        .expect("simulation");
    assert!(correct, "result check failed");
    (mat, forest)
}

fn assert_row(mat: &MatrixData, row: usize, cols: &[u32], values: &[f64]) {
    let begin = mat.c.row_ptr[row] as usize;
    let end = mat.c.row_end[row] as usize;
    assert_eq!(end - begin, cols.len(), "row {row} length");
    assert_eq!(&mat.c.col_idx[begin..end], cols, "row {row} columns");
    for (i, &v) in values.iter().enumerate() {
        let got = mat.c.values[begin + i];
        assert!(
            (got - v).abs() <= 1e-9 * v.abs().max(1.0),
            "row {row} value {i}: {got} != {v}"
        );
    }
}

// S1: tiny diagonal, both architectures
#[test]
fn s1_gamma_identity_on_diagonal() {
    let a = diag(&[1.0, 2.0, 3.0]);
    let (mat, gamma) = run_gamma(a.clone(), a, &gamma_config());
    assert_eq!(mat.num_mults, 3);
    assert_eq!(gamma.pe_stats().num_mults, 3);
    assert_eq!(gamma.pe_stats().num_adds, 0);
    assert_eq!(mat.c.nnz, 3);
    assert_row(&mat, 0, &[0], &[1.0]);
    assert_row(&mat, 1, &[1], &[4.0]);
    assert_row(&mat, 2, &[2], &[9.0]);
}

#[test]
fn s1_forest_identity_on_diagonal() {
    let a = diag(&[1.0, 2.0, 3.0]);
    let (mat, forest) = run_forest(a.clone(), a, &forest_config());
    assert_eq!(forest.manager_stats().num_mults, 3);
    let stats = forest.manager_stats();
    assert_eq!(stats.merge_tree_num_adds + stats.dyn_num_adds, 0);
    assert_eq!(mat.c.nnz, 3);
    assert_row(&mat, 0, &[0], &[1.0]);
    assert_row(&mat, 1, &[1], &[4.0]);
    assert_row(&mat, 2, &[2], &[9.0]);
}

// S2: one row whose fan-in exceeds the merge capacity
#[test]
fn s2_gamma_fan_in_exceeds_radix() {
    // one A row referencing 5 B rows with radix 4: one level-0 partial task
    // plus a final task folding the partial back in
    let a = Arc::new(CsrMatrix::from_coo(
        1,
        5,
        (0..5).map(|i| (0, i, (i + 1) as f64)).collect(),
    ));
    let b = diag(&[1.0; 5]);
    let (mat, gamma) = run_gamma(a, b, &gamma_config());
    assert_eq!(mat.num_mults, 5);
    assert_eq!(gamma.pe_stats().num_c_partial_rows, 1);
    assert_eq!(mat.c.nnz, 5);
    assert_row(
        &mat,
        0,
        &[0, 1, 2, 3, 4],
        &[1.0, 2.0, 3.0, 4.0, 5.0],
    );
}

#[test]
fn s2_forest_fan_in_exceeds_forest() {
    // 5 B rows against 2 trees * 2 inputs: the task tree spills one partial
    let a = Arc::new(CsrMatrix::from_coo(
        1,
        5,
        (0..5).map(|i| (0, i, (i + 1) as f64)).collect(),
    ));
    let b = diag(&[1.0; 5]);
    let (mat, forest) = run_forest(a, b, &forest_config());
    assert_eq!(forest.manager_stats().num_mults, 5);
    assert_eq!(forest.manager_stats().num_c_partial_rows, 1);
    assert_eq!(mat.c.nnz, 5);
    assert_row(
        &mat,
        0,
        &[0, 1, 2, 3, 4],
        &[1.0, 2.0, 3.0, 4.0, 5.0],
    );
}

// S3: all B rows distinct, no reuse
#[test]
fn s3_gamma_single_row() {
    let a = Arc::new(CsrMatrix::from_coo(
        1,
        3,
        vec![(0, 0, 1.0), (0, 1, 1.0), (0, 2, 1.0)],
    ));
    let b = diag(&[10.0, 20.0, 30.0]);
    let (mat, gamma) = run_gamma(a, b, &gamma_config());
    assert_eq!(mat.num_mults, 3);
    assert_eq!(gamma.pe_stats().num_adds, 0);
    assert_row(&mat, 0, &[0, 1, 2], &[10.0, 20.0, 30.0]);
}

#[test]
fn s3_forest_no_row_reuse() {
    let a = Arc::new(CsrMatrix::from_coo(
        1,
        3,
        vec![(0, 0, 1.0), (0, 1, 1.0), (0, 2, 1.0)],
    ));
    let b = diag(&[10.0, 20.0, 30.0]);
    let (mat, forest) = run_forest(a, b, &forest_config());
    assert_eq!(forest.manager_stats().num_mults, 3);
    let (fetched, reused) = forest.cache_stats();
    assert_eq!(fetched, 3);
    assert_eq!(reused, 0);
    assert_row(&mat, 0, &[0, 1, 2], &[10.0, 20.0, 30.0]);
}

/// Deterministic sparse test matrix; row nnz bounded by `max_row_nnz`.
fn pseudo_random_matrix(n: u32, max_row_nnz: u32) -> Arc<CsrMatrix> {
    let mut coo = Vec::new();
    let mut state = 0x2545f491u64;
    let mut next = || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 33) as u32
    };
    for i in 0..n {
        let nnz = next() % max_row_nnz + 1;
        for _ in 0..nnz {
            let col = next() % n;
            let value = (next() % 1000) as f64 / 100.0 + 0.5;
            coo.push((i, col, value));
        }
    }
    // duplicates would make the reference and the merge disagree on nnz
    coo.sort_by_key(|&(r, c, _)| (r, c));
    coo.dedup_by_key(|&mut (r, c, _)| (r, c));
    Arc::new(CsrMatrix::from_coo(n, n, coo))
}

// S4: sustained cache pressure with row reuse
#[test]
fn s4_gamma_cache_pressure() {
    let a = pseudo_random_matrix(100, 4);
    let (mat, gamma) = run_gamma(a.clone(), a, &gamma_config());
    assert_eq!(gamma.pe_stats().num_mults, mat.num_mults);
    assert_eq!(
        mat.c.nnz,
        gamma.pe_stats().num_mults - gamma.pe_stats().num_adds
    );
    let (b_data_reads, c_partial_reads, c_partial_writes) = gamma.cache_stats();
    assert!(b_data_reads >= mat.b_data_min_reads_fiber_cache);
    assert!(b_data_reads <= mat.b_data_max_reads_fiber_cache);
    assert_eq!(c_partial_reads, c_partial_writes);
}

#[test]
fn s4_forest_cache_pressure() {
    let a = pseudo_random_matrix(100, 4);
    let (mat, forest) = run_forest(a.clone(), a, &forest_config());
    let stats = forest.manager_stats();
    assert_eq!(stats.num_mults, mat.num_mults);
    assert_eq!(
        mat.c.nnz,
        stats.num_mults - stats.merge_tree_num_adds - stats.dyn_num_adds
    );
    let (fetched, reused) = forest.cache_stats();
    assert_eq!(fetched + reused, mat.preproc_b_row_ptr_end.len());
    let b_bytes = forest.b_elements_read() * crate::base::ELEMENT_SIZE;
    assert!(b_bytes >= mat.min_bytes_b_data);
    assert!(b_bytes <= mat.max_bytes_b_data);
}

// S5: empty B rows are skipped by the preprocessor
#[test]
fn s5_forest_empty_b_rows() {
    let a = diag(&[1.0; 10]);
    // B has rows 0..5 populated, 5..10 empty
    let b = Arc::new(CsrMatrix::from_coo(
        10,
        10,
        (0..5).map(|i| (i, i, 2.0)).collect(),
    ));
    let mat = MatrixData::new(a.clone(), b.clone(), true).expect("preprocessing");
    assert!(mat.preproc_a_values.len() < a.nnz);
    assert_eq!(mat.preproc_a_values.len(), 5);
    assert_eq!(mat.num_mults, 5);

    let (mat, forest) = run_forest(a, b, &forest_config());
    assert_eq!(forest.manager_stats().num_mults, 5);
    assert_eq!(mat.c.nnz, 5);
    for row in 0..5 {
        assert_row(&mat, row, &[row as u32], &[2.0]);
    }
    for row in 5..10 {
        assert_eq!(mat.c.row_ptr[row], mat.c.row_end[row]);
    }
}

// S6: identical runs are cycle-for-cycle reproducible
#[test]
fn s6_gamma_reproducibility() {
    let a = pseudo_random_matrix(50, 4);
    let (_, first) = run_gamma(a.clone(), a.clone(), &gamma_config());
    let (_, second) = run_gamma(a.clone(), a, &gamma_config());
    assert_eq!(first.stats_fingerprint(), second.stats_fingerprint());
}

#[test]
fn s6_forest_reproducibility() {
    let a = pseudo_random_matrix(50, 4);
    let (_, first) = run_forest(a.clone(), a.clone(), &forest_config());
    let (_, second) = run_forest(a.clone(), a, &forest_config());
    assert_eq!(first.stats_fingerprint(), second.stats_fingerprint());
}

/// One row wide enough to force a multi-level task tree and multi-block
/// partial fibers in both designs.
fn wide_row_matrix() -> Arc<CsrMatrix> {
    let n = 40;
    let mut coo: Vec<(u32, u32, f64)> = (0..n)
        .map(|c| (0, c, (c % 7 + 1) as f64 / 2.0))
        .collect();
    for i in 1..n {
        coo.push((i, i, (i % 5 + 1) as f64));
    }
    Arc::new(CsrMatrix::from_coo(n, n, coo))
}

#[test]
fn wide_row_task_tree_gamma() {
    let a = wide_row_matrix();
    let (mat, gamma) = run_gamma(a.clone(), a, &gamma_config());
    assert_eq!(gamma.pe_stats().num_mults, mat.num_mults);
    assert!(gamma.pe_stats().num_c_partial_rows > 1);
    assert_eq!(
        mat.c.nnz,
        gamma.pe_stats().num_mults - gamma.pe_stats().num_adds
    );
}

#[test]
fn wide_row_task_tree_forest() {
    let a = wide_row_matrix();
    let (mat, forest) = run_forest(a.clone(), a, &forest_config());
    let stats = forest.manager_stats();
    assert_eq!(stats.num_mults, mat.num_mults);
    assert!(stats.num_c_partial_rows > 1);
    assert_eq!(
        mat.c.nnz,
        stats.num_mults - stats.merge_tree_num_adds - stats.dyn_num_adds
    );
}

// both simulated results agree with the symbolic phase on result shape
#[test]
fn simulated_nnz_matches_symbolic_phase() {
    let a = pseudo_random_matrix(60, 4);
    let mut c_symbolic = CsrMatrix::default();
    spgemm_symbolic_phase(&a, &a, &mut c_symbolic).expect("symbolic phase");
    let (mat, _) = run_gamma(a.clone(), a.clone(), &gamma_config());
    assert_eq!(mat.c.nnz, c_symbolic.nnz);
    let (mat, _) = run_forest(a.clone(), a, &forest_config());
    assert_eq!(mat.c.nnz, c_symbolic.nnz);
}
