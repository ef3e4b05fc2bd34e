use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;

use anyhow::{ensure, Result};

use crate::base::math::{almost_equal, ratio};

/// Sparse matrix in compressed sparse row form.
///
/// `row_end` runs parallel to `row_ptr` and records the written extent of
/// each result row when the row allocation overapproximates row sizes; it is
/// empty for plain input matrices.
#[derive(Debug, Default, Clone)]
pub struct CsrMatrix {
    pub num_rows: u32,
    pub num_cols: u32,
    pub nnz: usize,
    pub row_ptr: Vec<u32>,
    pub row_end: Vec<u32>,
    pub col_idx: Vec<u32>,
    pub values: Vec<f64>,
}

impl CsrMatrix {
    /// Build from coordinate triples. Duplicates are kept; entries are
    /// sorted into row-major, column-ascending order.
    pub fn from_coo(num_rows: u32, num_cols: u32, mut coo: Vec<(u32, u32, f64)>) -> Self {
        coo.sort_by_key(|&(r, c, _)| (r, c));
        let nnz = coo.len();
        let mut mtx = CsrMatrix {
            num_rows,
            num_cols,
            nnz,
            row_ptr: vec![0; num_rows as usize + 1],
            row_end: Vec::new(),
            col_idx: Vec::with_capacity(nnz),
            values: Vec::with_capacity(nnz),
        };
        for &(row, col, value) in &coo {
            mtx.row_ptr[row as usize + 1] += 1;
            mtx.col_idx.push(col);
            mtx.values.push(value);
        }
        for i in 0..num_rows as usize {
            mtx.row_ptr[i + 1] += mtx.row_ptr[i];
        }
        mtx
    }

    pub fn transpose(&self) -> CsrMatrix {
        let mut coo = Vec::with_capacity(self.nnz);
        for i in 0..self.num_rows {
            for j in self.row_ptr[i as usize]..self.row_ptr[i as usize + 1] {
                coo.push((self.col_idx[j as usize], i, self.values[j as usize]));
            }
        }
        CsrMatrix::from_coo(self.num_cols, self.num_rows, coo)
    }

    pub fn row_size(&self, i: u32) -> u32 {
        self.row_ptr[i as usize + 1] - self.row_ptr[i as usize]
    }
}

/// B with each row's column indices packed into 64-bit buckets, used by the
/// symbolic phase to count result nnz without materializing rows.
struct PackedMatrix {
    row_ptr: Vec<u32>,
    col_set_idx: Vec<u32>,
    col_set: Vec<u64>,
}

impl PackedMatrix {
    fn new(a: &CsrMatrix) -> Self {
        let n_rows = a.num_rows as usize;
        let mut row_ptr = vec![0u32; n_rows + 1];
        for i in 0..n_rows {
            let mut counter = 0;
            let mut idx = 0u32;
            for j in a.row_ptr[i]..a.row_ptr[i + 1] {
                let col = a.col_idx[j as usize];
                if col >= idx {
                    counter += 1;
                    idx = col / 64 * 64 + 64;
                }
            }
            row_ptr[i + 1] = row_ptr[i] + counter;
        }
        let num_sets = row_ptr[n_rows] as usize;
        let mut col_set_idx = vec![0u32; num_sets];
        let mut col_set = vec![0u64; num_sets];
        for i in 0..n_rows {
            let mut k = row_ptr[i] as usize;
            let mut idx = 0u32;
            for j in a.row_ptr[i]..a.row_ptr[i + 1] {
                let col = a.col_idx[j as usize];
                if col >= idx {
                    idx = col / 64 * 64 + 64;
                    col_set_idx[k] = idx / 64 - 1;
                    col_set[k] = 0;
                    k += 1;
                }
                col_set[k - 1] |= 1u64 << (col % 64);
            }
        }
        PackedMatrix {
            row_ptr,
            col_set_idx,
            col_set,
        }
    }
}

/// Compute the exact row sizes of C = A * B into `c.row_ptr` (and `c.nnz`)
/// without computing values, using the packed column sets and a k-way heap.
pub fn spgemm_symbolic_phase(a: &CsrMatrix, b: &CsrMatrix, c: &mut CsrMatrix) -> Result<()> {
    ensure!(
        a.num_cols == b.num_rows,
        "matrices A and B don't have compatible dimensions"
    );
    let b_packed = PackedMatrix::new(b);
    c.num_rows = a.num_rows;
    c.num_cols = b.num_cols;
    c.row_ptr = vec![0; a.num_rows as usize + 1];

    let max_row_size = (0..a.num_rows).map(|i| a.row_size(i)).max().unwrap_or(0) as usize;
    let mut row_idx = vec![0u32; max_row_size];
    let mut row_end = vec![0u32; max_row_size];
    let mut heap: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::new();

    for i in 0..a.num_rows as usize {
        let mut cur_idx = u32::MAX;
        let mut counter = 0u32;
        let mut cur_set = 0u64;
        for j in 0..a.row_size(i as u32) {
            let a_col = a.col_idx[(a.row_ptr[i] + j) as usize] as usize;
            row_idx[j as usize] = b_packed.row_ptr[a_col];
            row_end[j as usize] = b_packed.row_ptr[a_col + 1];
            if row_idx[j as usize] < row_end[j as usize] {
                heap.push(Reverse((
                    b_packed.col_set_idx[row_idx[j as usize] as usize],
                    j,
                )));
            }
        }
        while let Some(Reverse((set_idx, j))) = heap.pop() {
            if set_idx == cur_idx {
                cur_set |= b_packed.col_set[row_idx[j as usize] as usize];
            } else {
                if cur_idx != u32::MAX {
                    counter += cur_set.count_ones();
                }
                cur_idx = set_idx;
                cur_set = b_packed.col_set[row_idx[j as usize] as usize];
            }
            row_idx[j as usize] += 1;
            if row_idx[j as usize] < row_end[j as usize] {
                heap.push(Reverse((
                    b_packed.col_set_idx[row_idx[j as usize] as usize],
                    j,
                )));
            }
        }
        if cur_idx != u32::MAX {
            counter += cur_set.count_ones();
        }
        c.row_ptr[i + 1] = c.row_ptr[i] + counter;
    }
    c.nnz = *c.row_ptr.last().expect("row_ptr never empty") as usize;
    Ok(())
}

/// Re-merge A * B row by row with a sorted heap and compare against the
/// simulated result element-wise. Additions use `mul_add` so the reference
/// accumulates the way the checker's tolerance assumes.
pub fn spgemm_check_result(a: &CsrMatrix, b: &CsrMatrix, c: &CsrMatrix) -> bool {
    print!("Checking result... ");
    let _ = std::io::stdout().flush();
    let max_row_size = (0..a.num_rows).map(|i| a.row_size(i)).max().unwrap_or(0) as usize;
    let mut b_row_addr = vec![0u32; max_row_size];
    let mut b_row_end = vec![0u32; max_row_size];
    let mut a_values = vec![0f64; max_row_size];
    let mut heap: BinaryHeap<Reverse<(u32, u32)>> = BinaryHeap::new();

    for i in 0..a.num_rows as usize {
        let mut cur_idx = u32::MAX;
        let mut cur_value = 0.0;
        let mut offset = c.row_ptr[i] as usize;
        for j in 0..a.row_size(i as u32) as usize {
            let a_col = a.col_idx[a.row_ptr[i] as usize + j] as usize;
            b_row_addr[j] = b.row_ptr[a_col];
            b_row_end[j] = b.row_ptr[a_col + 1];
            a_values[j] = a.values[a.row_ptr[i] as usize + j];
            if b_row_addr[j] < b_row_end[j] {
                heap.push(Reverse((b.col_idx[b_row_addr[j] as usize], j as u32)));
            }
        }
        let mut row_ok = true;
        while let Some(Reverse((col, j))) = heap.pop() {
            let j = j as usize;
            if col == cur_idx {
                cur_value = a_values[j].mul_add(b.values[b_row_addr[j] as usize], cur_value);
            } else {
                if cur_idx != u32::MAX {
                    if c.col_idx[offset] != cur_idx || !almost_equal(c.values[offset], cur_value, 1e6)
                    {
                        println!(
                            "\nError in row {}: {}, {} should be {}, {}",
                            i, c.col_idx[offset], c.values[offset], cur_idx, cur_value
                        );
                        row_ok = false;
                        break;
                    }
                    offset += 1;
                }
                cur_idx = col;
                cur_value = a_values[j] * b.values[b_row_addr[j] as usize];
            }
            b_row_addr[j] += 1;
            if b_row_addr[j] < b_row_end[j] {
                heap.push(Reverse((b.col_idx[b_row_addr[j] as usize], j as u32)));
            }
        }
        if !row_ok {
            heap.clear();
            return false;
        }
        if cur_idx != u32::MAX {
            if c.col_idx[offset] != cur_idx || !almost_equal(c.values[offset], cur_value, 1e6) {
                println!(
                    "\nError in row {}: {}, {} should be {}, {}",
                    i, c.col_idx[offset], c.values[offset], cur_idx, cur_value
                );
                return false;
            }
            offset += 1;
        }
        if offset != c.row_end[i] as usize {
            println!(
                "\nError in row end {}: {} should be {}",
                i, c.row_end[i], offset
            );
            return false;
        }
    }
    println!("Correct!");
    true
}

/// Symbolic-phase-only SpGEMM summary, written to `out` (a file or stdout).
pub fn print_spgemm_stats(a: &CsrMatrix, b: &CsrMatrix, out: &mut dyn Write) -> Result<()> {
    let mut c_symbolic = CsrMatrix::default();
    spgemm_symbolic_phase(a, b, &mut c_symbolic)?;

    let mut num_mults = 0usize;
    let mut a_max_row_size = 0usize;
    let mut a_min_row_size = a.num_rows as usize;
    let mut b_max_row_size = 0usize;
    let mut b_min_row_size = b.num_rows as usize;
    let mut rows_to_process = 0usize;
    let mut a_data_num_elements = 0usize;
    let mut min_bytes_b_data = 0usize;
    let mut b_row_set = std::collections::HashSet::new();

    for i in 0..a.num_rows {
        let mut non_empty_rows = 0usize;
        for j in a.row_ptr[i as usize]..a.row_ptr[i as usize + 1] {
            let b_row = a.col_idx[j as usize];
            let b_row_size = b.row_size(b_row) as usize;
            if b_row_size > 0 {
                if b_row_set.insert(b_row) {
                    min_bytes_b_data += b_row_size;
                }
                non_empty_rows += 1;
                num_mults += b_row_size;
            }
            b_max_row_size = b_max_row_size.max(b_row_size);
            b_min_row_size = b_min_row_size.min(b_row_size);
        }
        let a_row_size = a.row_size(i) as usize;
        a_max_row_size = a_max_row_size.max(a_row_size);
        a_min_row_size = a_min_row_size.min(a_row_size);
        if non_empty_rows > 0 {
            rows_to_process += 1;
            a_data_num_elements += non_empty_rows;
        }
    }

    let a_bytes = rows_to_process * 3 * 4 + a_data_num_elements * (8 + 2 * 4);
    let c_bytes = c_symbolic.nnz * (4 + 8);
    let b_max_bytes = num_mults * (4 + 8);
    min_bytes_b_data *= 4 + 8;

    writeln!(out, "*---Matrix A---*")?;
    writeln!(out, "dimensions: {}x{}", a.num_rows, a.num_cols)?;
    writeln!(out, "nnz: {}", a.nnz)?;
    writeln!(
        out,
        "density: {:.4e}",
        ratio(a.nnz, a.num_rows as usize) / a.num_cols as f64
    )?;
    writeln!(
        out,
        "avg nnz per row: {:.4}",
        ratio(a.nnz, a.num_rows as usize)
    )?;
    writeln!(out, "max nnz per row: {}", a_max_row_size)?;
    writeln!(out, "min nnz per row: {}", a_min_row_size)?;
    writeln!(out, "*---Matrix B---*")?;
    writeln!(out, "dimensions: {}x{}", b.num_rows, b.num_cols)?;
    writeln!(out, "nnz: {}", b.nnz)?;
    writeln!(
        out,
        "density: {:.4e}",
        ratio(b.nnz, b.num_rows as usize) / b.num_cols as f64
    )?;
    writeln!(
        out,
        "avg nnz per row: {:.4}",
        ratio(b.nnz, b.num_rows as usize)
    )?;
    writeln!(out, "max nnz per row: {}", b_max_row_size)?;
    writeln!(out, "min nnz per row: {}", b_min_row_size)?;
    writeln!(out, "*---SpGEMM---*")?;
    writeln!(out, "number of mults: {}", num_mults)?;
    writeln!(out, "number of adds: {}", num_mults - c_symbolic.nnz)?;
    writeln!(out, "nnz of result: {}", c_symbolic.nnz)?;
    writeln!(
        out,
        "compression factor (n_mults/result nnz): {:.4}",
        ratio(num_mults, c_symbolic.nnz)
    )?;
    writeln!(out, "A data bytes: {} ({:.4} MB)", a_bytes, a_bytes as f64 * 1e-6)?;
    writeln!(out, "C data bytes: {} ({:.4} MB)", c_bytes, c_bytes as f64 * 1e-6)?;
    writeln!(
        out,
        "B compulsory data bytes: {} ({:.4} MB)",
        min_bytes_b_data,
        min_bytes_b_data as f64 * 1e-6
    )?;
    writeln!(
        out,
        "B maximum data bytes: {} ({:.4} MB)",
        b_max_bytes,
        b_max_bytes as f64 * 1e-6
    )?;
    writeln!(
        out,
        "operational intensity (no B row reuse): {:.4} flops/byte",
        ratio(num_mults, a_bytes + b_max_bytes + c_bytes)
    )?;
    writeln!(
        out,
        "operational intensity (full B row reuse): {:.4} flops/byte",
        ratio(num_mults, a_bytes + min_bytes_b_data + c_bytes)
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub fn diag(values: &[f64]) -> CsrMatrix {
        let coo = values
            .iter()
            .enumerate()
            .map(|(i, &v)| (i as u32, i as u32, v))
            .collect();
        CsrMatrix::from_coo(values.len() as u32, values.len() as u32, coo)
    }

    #[test]
    fn from_coo_sorts_and_builds_row_ptr() {
        let m = CsrMatrix::from_coo(3, 3, vec![(2, 0, 3.0), (0, 1, 1.0), (0, 0, 2.0)]);
        assert_eq!(m.row_ptr, vec![0, 2, 2, 3]);
        assert_eq!(m.col_idx, vec![0, 1, 0]);
        assert_eq!(m.values, vec![2.0, 1.0, 3.0]);
    }

    #[test]
    fn transpose_roundtrip() {
        let m = CsrMatrix::from_coo(2, 3, vec![(0, 2, 1.0), (1, 0, 2.0), (1, 1, 3.0)]);
        let t = m.transpose();
        assert_eq!(t.num_rows, 3);
        assert_eq!(t.num_cols, 2);
        assert_eq!(t.row_ptr, vec![0, 1, 2, 3]);
        assert_eq!(t.col_idx, vec![1, 1, 0]);
        let tt = t.transpose();
        assert_eq!(tt.row_ptr, m.row_ptr);
        assert_eq!(tt.col_idx, m.col_idx);
        assert_eq!(tt.values, m.values);
    }

    #[test]
    fn symbolic_phase_counts_exact_nnz() {
        // A = [[1,1,0],[0,1,1]], B = [[1,0,1],[0,1,0],[1,1,0]]
        let a = CsrMatrix::from_coo(
            2,
            3,
            vec![(0, 0, 1.0), (0, 1, 1.0), (1, 1, 1.0), (1, 2, 1.0)],
        );
        let b = CsrMatrix::from_coo(
            3,
            3,
            vec![(0, 0, 1.0), (0, 2, 1.0), (1, 1, 1.0), (2, 0, 1.0), (2, 1, 1.0)],
        );
        let mut c = CsrMatrix::default();
        spgemm_symbolic_phase(&a, &b, &mut c).unwrap();
        // row 0: cols {0,1,2}; row 1: cols {0,1}
        assert_eq!(c.row_ptr, vec![0, 3, 5]);
        assert_eq!(c.nnz, 5);
    }

    #[test]
    fn symbolic_phase_spans_many_buckets() {
        let a = diag(&[1.0; 3]);
        let b = CsrMatrix::from_coo(
            3,
            200,
            vec![(0, 0, 1.0), (0, 63, 1.0), (0, 64, 1.0), (1, 199, 1.0), (2, 5, 1.0)],
        );
        let mut c = CsrMatrix::default();
        spgemm_symbolic_phase(&a, &b, &mut c).unwrap();
        assert_eq!(c.row_ptr, vec![0, 3, 4, 5]);
    }

    #[test]
    fn symbolic_phase_rejects_dimension_mismatch() {
        let a = diag(&[1.0, 2.0]);
        let b = diag(&[1.0, 2.0, 3.0]);
        let mut c = CsrMatrix::default();
        assert!(spgemm_symbolic_phase(&a, &b, &mut c).is_err());
    }

    #[test]
    fn check_result_accepts_reference_product() {
        let a = diag(&[1.0, 2.0, 3.0]);
        let b = diag(&[1.0, 2.0, 3.0]);
        let mut c = CsrMatrix {
            num_rows: 3,
            num_cols: 3,
            nnz: 3,
            row_ptr: vec![0, 1, 2, 3],
            row_end: vec![1, 2, 3],
            col_idx: vec![0, 1, 2],
            values: vec![1.0, 4.0, 9.0],
        };
        assert!(spgemm_check_result(&a, &b, &c));
        c.values[1] = 5.0;
        assert!(!spgemm_check_result(&a, &b, &c));
    }
}
