pub mod cache;
pub mod manager;
pub mod matb;
pub mod tree;

use std::io::Write;

use anyhow::Result;
use log::error;
use toml::Value;

use crate::base::math::{fratio, ratio, reqs_to_mb, unused_bytes_ratio};
use crate::base::port::connect;
use crate::base::{ELEMENT_SIZE, INVALID_IDX, MEM_TRANSACTION_SIZE};
use crate::forest::cache::LinkedListCache;
use crate::forest::manager::MergeTreeManager;
use crate::matrix::csr::spgemm_check_result;
use crate::matrix::data::MatrixData;
use crate::sim::config::{clock_period_ns, Config, LinkedListCacheConfig, MemConfig, MergeTreeConfig};
use crate::sim::mem::MainMemory;

const PROGRESS_INTERVAL: u64 = 10000;

/// One B row admitted to the cache: its element offset and the cache block
/// assigned to the row head.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchedRow {
    pub b_row_ptr: u32,
    pub row_head_ptr: u32,
}

/// Read the cache block at `row_ptr` on behalf of merge-tree input `id`.
#[derive(Debug, Clone, Copy)]
pub struct CacheRead {
    pub row_ptr: u32,
    pub id: u32,
}

impl Default for CacheRead {
    fn default() -> Self {
        CacheRead {
            row_ptr: INVALID_IDX,
            id: 0,
        }
    }
}

impl CacheRead {
    pub fn valid(&self) -> bool {
        self.row_ptr != INVALID_IDX
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWriteKind {
    Write,
    WriteLast,
}

/// Append one block of the in-flight partial row to the cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheWrite {
    pub kind: CacheWriteKind,
    pub num_elements: u32,
}

/// `row_ptr` is the next block in the chain, or the invalid sentinel at
/// end-of-row.
#[derive(Debug, Clone, Copy)]
pub struct CacheResponse {
    pub row_ptr: u32,
    pub num_elements: u32,
    pub id: u32,
}

/// Hardware shape of the merge forest, resolved from the config section.
#[derive(Debug, Clone)]
pub struct ForestParams {
    pub max_prefetched_rows: usize,
    pub merge_tree_size: usize,
    pub max_rows_merge: usize,
    pub merge_tree_merger_width: usize,
    pub merge_tree_merger_num_adds: usize,
    pub num_final_mergers: usize,
    pub dyn_merger_width: usize,
    pub dyn_merger_num_adds: usize,
    pub input_buffer_size: usize,
    pub output_buffer_size: usize,
}

#[derive(Debug, Default)]
pub struct ForestStats {
    pub num_mults: usize,
    pub num_block_mults: usize,
    pub merge_tree_num_merges: usize,
    pub dyn_num_merges: usize,
    pub merge_tree_num_adds: usize,
    pub dyn_num_adds: usize,
    pub num_idle_cycles: usize,
    pub c_writes: usize,
    pub preproc_a_reads: usize,
    pub num_c_partial_rows: usize,
    pub num_c_partial_elements: usize,
    pub prefetch_stalls: usize,
    pub a_data_stalls: usize,
    pub c_partial_stalls: usize,
    pub max_write_bytes: usize,
}

/// Hierarchical merge-forest accelerator: merge trees + dynamic mergers
/// over a linked-list row cache.
pub struct MergeForest {
    merge_tree_manager: MergeTreeManager,
    linked_list_cache: LinkedListCache,
    main_mem: MainMemory,
    pub cycles: u64,
    period_ns: f64,
}

impl MergeForest {
    pub fn new(config: &Value, mat: &MatrixData) -> Result<Self> {
        let tree_config = MergeTreeConfig::from_config(config);
        let cache_config = LinkedListCacheConfig::from_config(config);
        let mem_config = MemConfig::from_config(config);

        let mut merge_tree_manager = MergeTreeManager::new(&tree_config, mat)?;
        let mut linked_list_cache = LinkedListCache::new(&cache_config, &tree_config, mat)?;
        let mut main_mem = MainMemory::new(&mem_config);
        main_mem.set_num_ports(
            1 + linked_list_cache.num_mem_ports() + merge_tree_manager.num_mem_ports(),
        );

        connect(merge_tree_manager.mem_read_port_mut(), main_mem.port_mut(0));
        let mut port_idx = 1;
        for i in 0..linked_list_cache.num_mem_ports() {
            connect(linked_list_cache.mem_port_mut(i), main_mem.port_mut(port_idx));
            port_idx += 1;
        }
        for i in 0..merge_tree_manager.num_mem_ports() {
            connect(
                merge_tree_manager.mem_write_port_mut(i),
                main_mem.port_mut(port_idx),
            );
            port_idx += 1;
        }
        connect(
            merge_tree_manager.prefetch_port_mut(),
            linked_list_cache.prefetch_port_mut(),
        );
        for i in 0..merge_tree_manager.num_cache_read_ports() {
            connect(
                merge_tree_manager.cache_read_port_mut(i),
                linked_list_cache.read_port_mut(i),
            );
        }
        connect(
            merge_tree_manager.cache_write_port_mut(),
            linked_list_cache.write_port_mut(),
        );

        Ok(MergeForest {
            merge_tree_manager,
            linked_list_cache,
            main_mem,
            cycles: 0,
            period_ns: clock_period_ns(config),
        })
    }

    fn reset(&mut self, mat: &MatrixData) {
        self.merge_tree_manager.reset(mat);
        self.linked_list_cache.reset(mat);
        self.main_mem.reset();
        self.cycles = 0;
    }

    fn print_progress(&self, mat: &MatrixData) {
        if self.merge_tree_manager.stats.num_mults == 0 {
            print!("progress:   0.00%\r");
        } else {
            let progress =
                self.merge_tree_manager.stats.num_mults as f64 / mat.num_mults as f64 * 100.0;
            print!("progress: {:6.2}%\r", progress);
        }
        let _ = std::io::stdout().flush();
    }

    pub fn run_simulation(&mut self, mat: &mut MatrixData, out: &mut dyn Write) -> Result<bool> {
        self.reset(mat);
        loop {
            self.merge_tree_manager.update(mat);
            self.linked_list_cache.update();
            self.main_mem.update();
            self.linked_list_cache.apply()?;
            self.merge_tree_manager.apply();
            if self.cycles % PROGRESS_INTERVAL == 0 {
                self.print_progress(mat);
            }
            self.cycles += 1;
            if self.merge_tree_manager.finished(mat) && self.main_mem.inactive() {
                break;
            }
        }
        println!("progress: 100.00%");
        self.check_valid_simulation(mat);
        let correct = if mat.compute_result {
            spgemm_check_result(&mat.a, &mat.b, &mat.c)
        } else {
            true
        };
        self.print_stats(mat, out)?;
        Ok(correct)
    }

    fn check_valid_simulation(&self, mat: &MatrixData) {
        let stats = &self.merge_tree_manager.stats;
        let cache = &self.linked_list_cache;
        if mat.num_mults != stats.num_mults {
            error!("number of multiplications doesn't match the expected value");
        }
        let num_adds = stats.merge_tree_num_adds + stats.dyn_num_adds;
        if mat.num_mults != mat.c.nnz + num_adds {
            error!("number of additions doesn't match the expected value");
        }
        let num_reads = stats.preproc_a_reads
            + cache.preproc_a_reads
            + cache.b_reads
            + cache.c_partial_reads;
        if self.main_mem.read_requests != num_reads {
            error!("number of reads in Main Memory doesn't match the rest of the system");
        }
        let num_writes = stats.c_writes + cache.c_partial_writes;
        if self.main_mem.write_requests != num_writes {
            error!("number of writes in Main Memory doesn't match the rest of the system");
        }
        if cache.c_partial_reads != cache.c_partial_writes {
            error!("number of reads and writes of C partial data doesn't match");
        }
        let b_bytes_read = cache.b_elements_read * ELEMENT_SIZE;
        if b_bytes_read < mat.min_bytes_b_data {
            error!("number of B bytes read too small");
        }
        if b_bytes_read > mat.max_bytes_b_data {
            error!("number of B bytes read too big");
        }
        if cache.b_reads < mat.b_data_min_reads {
            error!("number of B reads too small");
        }
        if cache.b_reads > mat.b_data_max_reads {
            error!("number of B reads too big");
        }
        if cache.fetched_rows + cache.reused_rows != mat.preproc_b_row_ptr_end.len() {
            error!("number of fetched and reused B rows doesn't match total number of B rows");
        }
    }

    pub fn stats_fingerprint(&self) -> (u64, usize, usize, usize, usize) {
        (
            self.cycles,
            self.merge_tree_manager.stats.num_mults,
            self.merge_tree_manager.stats.merge_tree_num_adds
                + self.merge_tree_manager.stats.dyn_num_adds,
            self.main_mem.read_requests,
            self.main_mem.write_requests,
        )
    }

    pub fn manager_stats(&self) -> &ForestStats {
        &self.merge_tree_manager.stats
    }

    pub fn cache_stats(&self) -> (usize, usize) {
        (
            self.linked_list_cache.fetched_rows,
            self.linked_list_cache.reused_rows,
        )
    }

    pub fn b_elements_read(&self) -> usize {
        self.linked_list_cache.b_elements_read
    }

    fn print_stats(&self, mat: &MatrixData, out: &mut dyn Write) -> Result<()> {
        let stats = &self.merge_tree_manager.stats;
        let cache = &self.linked_list_cache;
        let params = &self.merge_tree_manager.params;
        let cycles = self.cycles as usize;
        let exec_time_ns = cycles as f64 * self.period_ns;
        let exec_time_ms = exec_time_ns * 1e-6;
        let gflops = mat.num_mults as f64 / exec_time_ns;
        let block_mults_ratio = ratio(
            mat.num_mults,
            stats.num_block_mults * params.merge_tree_merger_width,
        ) * 100.0;
        let num_adds = stats.merge_tree_num_adds + stats.dyn_num_adds;
        let merge_tree_adds_ratio = ratio(
            stats.merge_tree_num_adds,
            stats.merge_tree_num_merges * params.merge_tree_merger_num_adds,
        ) * 100.0;
        let dyn_adds_ratio = ratio(
            stats.dyn_num_adds,
            stats.dyn_num_merges * params.dyn_merger_num_adds,
        ) * 100.0;
        let num_trees = self.merge_tree_manager.num_cache_read_ports();
        let mem_traffic = self.main_mem.read_requests + self.main_mem.write_requests;
        let mem_traffic_bytes = (mem_traffic * MEM_TRANSACTION_SIZE) as f64;
        let preproc_a_reads = stats.preproc_a_reads + cache.preproc_a_reads;
        let preproc_a_bytes_read = mat.preproc_a_bytes();
        let b_bytes_read = cache.b_elements_read * ELEMENT_SIZE;
        let c_partial_bytes_rw = cache.c_partial_reads * MEM_TRANSACTION_SIZE;
        let mem_bytes_read = preproc_a_bytes_read + b_bytes_read + c_partial_bytes_rw;
        let c_bytes_write = mat.c.nnz * ELEMENT_SIZE;
        let mem_bytes_write = c_bytes_write + c_partial_bytes_rw;
        let active_blocks_avg = ratio(cache.num_active_blocks_avg, cache.num_samples);
        let inactive_blocks_avg = ratio(cache.num_inactive_blocks_avg, cache.num_samples);
        let c_partial_blocks_avg = ratio(cache.num_c_partial_blocks_avg, cache.num_samples);
        let free_blocks_avg = ratio(cache.num_free_blocks_avg, cache.num_samples);

        writeln!(out, "*---Simulation Results---*")?;
        writeln!(out, "Num cycles: {}", self.cycles)?;
        writeln!(out, "Clock period: {} ns", self.period_ns)?;
        writeln!(out, "Execution time: {:.4} ms", exec_time_ms)?;
        writeln!(out, "GFlops: {:.4}", gflops)?;
        writeln!(out, "*---Merge Tree Manager---*")?;
        writeln!(out, "Number flops (mults): {}", mat.num_mults)?;
        writeln!(
            out,
            "Number block mults: {} ({:.4}%) utilization",
            stats.num_block_mults, block_mults_ratio
        )?;
        writeln!(out, "Number adds : {}", num_adds)?;
        writeln!(
            out,
            "Number merge tree merges : {} ({:.4}% adder utilization)",
            stats.merge_tree_num_merges, merge_tree_adds_ratio
        )?;
        writeln!(
            out,
            "Number dynamic merges : {} ({:.4}% adder utilization)",
            stats.dyn_num_merges, dyn_adds_ratio
        )?;
        writeln!(
            out,
            "Dynamic merges per cycle: {:.4}",
            ratio(stats.dyn_num_merges, cycles)
        )?;
        writeln!(
            out,
            "Idle cycles: {} ({:.4}%)",
            stats.num_idle_cycles,
            ratio(stats.num_idle_cycles, cycles * num_trees) * 100.0
        )?;
        writeln!(
            out,
            "A data stalls: {} ({:.4}%)",
            stats.a_data_stalls,
            ratio(stats.a_data_stalls, cycles) * 100.0
        )?;
        writeln!(
            out,
            "C partial stalls: {} ({:.4}%)",
            stats.c_partial_stalls,
            ratio(stats.c_partial_stalls, cycles) * 100.0
        )?;
        writeln!(out, "C partial rows: {}", stats.num_c_partial_rows)?;
        writeln!(out, "C partial elements: {}", stats.num_c_partial_elements)?;
        writeln!(out, "Max write bytes: {}", stats.max_write_bytes)?;
        writeln!(out, "*---Linked List Cache---*")?;
        writeln!(out, "Cache reads: {}", cache.reads)?;
        writeln!(out, "Cache writes: {}", cache.writes)?;
        writeln!(
            out,
            "Cache bandwidth: {:.4} blocks/cycle",
            ratio(cache.reads + cache.writes, cycles)
        )?;
        writeln!(out, "Fetched rows: {}", cache.fetched_rows)?;
        writeln!(out, "Reused rows: {}", cache.reused_rows)?;
        writeln!(out, "Evicted rows: {}", cache.evictions)?;
        writeln!(out, "Max active rows: {}", cache.stats_max_active_rows)?;
        writeln!(out, "Max inactive rows: {}", cache.stats_max_inactive_rows)?;
        writeln!(
            out,
            "Average active blocks: {:.4} ({:.4}%)",
            active_blocks_avg,
            fratio(active_blocks_avg, cache.num_blocks) * 100.0
        )?;
        writeln!(
            out,
            "Average inactive blocks: {:.4} ({:.4}%)",
            inactive_blocks_avg,
            fratio(inactive_blocks_avg, cache.num_blocks) * 100.0
        )?;
        writeln!(
            out,
            "Average C_partial blocks: {:.4} ({:.4}%)",
            c_partial_blocks_avg,
            fratio(c_partial_blocks_avg, cache.num_blocks) * 100.0
        )?;
        writeln!(
            out,
            "Average free blocks: {:.4} ({:.4}%)",
            free_blocks_avg,
            fratio(free_blocks_avg, cache.num_blocks) * 100.0
        )?;
        writeln!(out, "Max free lists: {}", cache.max_free_lists)?;
        writeln!(out, "Max fetched rows: {}", cache.stats_max_fetched_rows)?;
        writeln!(
            out,
            "Max outstanding reqs: {}",
            cache.stats_max_outstanding_reqs
        )?;
        writeln!(out, "*---Main Memory---*")?;
        writeln!(
            out,
            "Memory bandwidth: {:.4} GB/s",
            mem_traffic_bytes / exec_time_ns
        )?;
        writeln!(
            out,
            "Operational intensity: {:.4} flop/byte",
            mat.num_mults as f64 / mem_traffic_bytes
        )?;
        writeln!(
            out,
            "Memory traffic: {} transactions ({:.4} MB) ({:.4}% unused)",
            mem_traffic,
            reqs_to_mb(mem_traffic),
            unused_bytes_ratio(mem_traffic, mem_bytes_read + mem_bytes_write)
        )?;
        writeln!(
            out,
            "Memory reads: {} ({:.4} MB) ({:.4}% unused)",
            self.main_mem.read_requests,
            reqs_to_mb(self.main_mem.read_requests),
            unused_bytes_ratio(self.main_mem.read_requests, mem_bytes_read)
        )?;
        writeln!(
            out,
            "Memory writes: {} ({:.4} MB) ({:.4}% unused)",
            self.main_mem.write_requests,
            reqs_to_mb(self.main_mem.write_requests),
            unused_bytes_ratio(self.main_mem.write_requests, mem_bytes_write)
        )?;
        writeln!(
            out,
            "A data reads: {} ({:.4} MB) ({:.4}% unused)",
            preproc_a_reads,
            reqs_to_mb(preproc_a_reads),
            unused_bytes_ratio(preproc_a_reads, preproc_a_bytes_read)
        )?;
        writeln!(
            out,
            "B data reads: {} ({:.4} MB) ({:.4}% unused)",
            cache.b_reads,
            reqs_to_mb(cache.b_reads),
            unused_bytes_ratio(cache.b_reads, b_bytes_read)
        )?;
        writeln!(
            out,
            "B data min reads: {} ({:.4} MB)",
            mat.b_data_min_reads,
            reqs_to_mb(mat.b_data_min_reads)
        )?;
        writeln!(
            out,
            "B data max reads: {} ({:.4} MB)",
            mat.b_data_max_reads,
            reqs_to_mb(mat.b_data_max_reads)
        )?;
        writeln!(
            out,
            "C partial reads/writes: {} ({:.4} MB) (0% unused)",
            cache.c_partial_reads,
            reqs_to_mb(cache.c_partial_reads)
        )?;
        writeln!(
            out,
            "C data writes: {} ({:.4} MB) ({:.4}% unused)",
            stats.c_writes,
            reqs_to_mb(stats.c_writes),
            unused_bytes_ratio(stats.c_writes, c_bytes_write)
        )?;
        writeln!(out, "A data bytes read: {}", preproc_a_bytes_read)?;
        writeln!(out, "B data bytes read: {}", b_bytes_read)?;
        writeln!(out, "C data bytes written: {}", c_bytes_write)?;
        Ok(())
    }
}
