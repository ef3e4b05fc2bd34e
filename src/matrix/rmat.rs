use std::io::Write;
use std::path::Path;

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::matrix::mmio::write_matrix_market_pattern;

/// Generate an R-MAT graph by recursive quadrant descent and write it as a
/// pattern Matrix Market file. Self loops and duplicate edges are rejected
/// and retried. The per-depth quadrant probabilities are jittered once up
/// front so the degree distribution is not perfectly self-similar.
pub fn gen_rmat(
    out_path: &Path,
    num_nodes: u32,
    num_edges: u32,
    a: f64,
    b: f64,
    c: f64,
    seed: u64,
) -> Result<()> {
    ensure!(
        a + b + c < 1.0,
        "invalid parameters: A + B + C must be smaller than 1.0"
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let edges = gen_rmat_edges(&mut rng, num_nodes, num_edges, a, b, c);
    write_matrix_market_pattern(out_path, num_nodes, &edges, seed)
}

pub fn gen_rmat_edges(
    rng: &mut StdRng,
    num_nodes: u32,
    num_edges: u32,
    a: f64,
    b: f64,
    c: f64,
) -> Vec<(u32, u32)> {
    // per-depth noisy partition sums; 128 levels covers any node count
    let mut sum_a = Vec::with_capacity(128);
    let mut sum_ab = Vec::with_capacity(128);
    let mut sum_ac = Vec::with_capacity(128);
    let mut sum_abc = Vec::with_capacity(128);
    for _ in 0..128 {
        let na = a * rng.gen_range(0.5..1.5);
        let nb = b * rng.gen_range(0.5..1.5);
        let nc = c * rng.gen_range(0.5..1.5);
        let nd = (1.0 - (a + b + c)) * rng.gen_range(0.5..1.5);
        let abcd = na + nb + nc + nd;
        sum_a.push(na / abcd);
        sum_ab.push((na + nb) / abcd);
        sum_ac.push((na + nc) / abcd);
        sum_abc.push((na + nb + nc) / abcd);
    }

    let mut edge_list: Vec<(u32, u32)> = Vec::with_capacity(num_edges as usize);
    let mut collisions = 0usize;
    let mut edge = 0u32;
    while edge < num_edges {
        let mut rng_x = num_nodes;
        let mut rng_y = num_nodes;
        let mut off_x = 0u32;
        let mut off_y = 0u32;
        let mut depth = 0usize;
        while rng_x > 1 || rng_y > 1 {
            let rnd_prob: f64 = rng.gen_range(0.0..1.0);
            if rng_x > 1 && rng_y > 1 {
                if rnd_prob < sum_a[depth] {
                    rng_x /= 2;
                    rng_y /= 2;
                } else if rnd_prob < sum_ab[depth] {
                    off_x += rng_x / 2;
                    rng_x -= rng_x / 2;
                    rng_y /= 2;
                } else if rnd_prob < sum_abc[depth] {
                    off_y += rng_y / 2;
                    rng_x /= 2;
                    rng_y -= rng_y / 2;
                } else {
                    off_x += rng_x / 2;
                    off_y += rng_y / 2;
                    rng_x -= rng_x / 2;
                    rng_y -= rng_y / 2;
                }
            } else if rng_x > 1 {
                // row vector
                if rnd_prob < sum_ac[depth] {
                    rng_x /= 2;
                } else {
                    off_x += rng_x / 2;
                    rng_x -= rng_x / 2;
                }
            } else {
                // column vector
                if rnd_prob < sum_ab[depth] {
                    rng_y /= 2;
                } else {
                    off_y += rng_y / 2;
                    rng_y -= rng_y / 2;
                }
            }
            depth += 1;
        }
        if off_x == off_y {
            collisions += 1;
            continue;
        }
        let new_edge = (off_x, off_y);
        match edge_list.binary_search(&new_edge) {
            Ok(_) => collisions += 1,
            Err(pos) => {
                edge_list.insert(pos, new_edge);
                edge += 1;
            }
        }
    }
    println!(
        "RMat: nodes:{}, edges:{}, Iterations:{}, Collisions:{} ({:.1}%).",
        num_nodes,
        num_edges,
        num_edges as usize + collisions,
        collisions,
        100.0 * collisions as f64 / (num_edges as usize + collisions) as f64
    );
    let _ = std::io::stdout().flush();
    edge_list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_edge_count() {
        let mut rng = StdRng::seed_from_u64(42);
        let edges = gen_rmat_edges(&mut rng, 64, 100, 0.45, 0.25, 0.15);
        assert_eq!(edges.len(), 100);
        // sorted, unique, no self loops, in range
        for w in edges.windows(2) {
            assert!(w[0] < w[1]);
        }
        for &(x, y) in &edges {
            assert_ne!(x, y);
            assert!(x < 64 && y < 64);
        }
    }

    #[test]
    fn same_seed_same_graph() {
        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let e1 = gen_rmat_edges(&mut rng1, 32, 50, 0.5, 0.2, 0.2);
        let e2 = gen_rmat_edges(&mut rng2, 32, 50, 0.5, 0.2, 0.2);
        assert_eq!(e1, e2);
    }

    #[test]
    fn rejects_invalid_partition() {
        let dir = std::env::temp_dir().join("rmat_invalid.mtx");
        assert!(gen_rmat(&dir, 16, 10, 0.5, 0.4, 0.2, 0).is_err());
    }
}
