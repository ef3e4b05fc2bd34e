pub mod cache;
pub mod manager;
pub mod pe;

use std::io::Write;

use anyhow::{Context, Result};
use log::error;
use toml::Value;

use crate::base::math::{ratio, reqs_to_mb, unused_bytes_ratio};
use crate::base::{ELEMENT_SIZE, MEM_TRANSACTION_SIZE};
use crate::base::port::connect;
use crate::gamma::cache::FiberCache;
use crate::gamma::manager::PeManager;
use crate::matrix::csr::spgemm_check_result;
use crate::matrix::data::MatrixData;
use crate::sim::config::{clock_period_ns, Config, FiberCacheConfig, MemConfig, PeManagerConfig};
use crate::sim::mem::MainMemory;

const PROGRESS_INTERVAL: u64 = 10000;

/// Baseline row-merge accelerator: PE array + set-associative fiber cache.
pub struct Gamma {
    pe_manager: PeManager,
    fiber_cache: FiberCache,
    main_mem: MainMemory,
    pub cycles: u64,
    period_ns: f64,
    config_desc: String,
}

impl Gamma {
    pub fn new(config: &Value, mat: &MatrixData) -> Result<Self> {
        let pe_config = PeManagerConfig::from_config(config);
        let cache_config = FiberCacheConfig::from_config(config);
        let mem_config = MemConfig::from_config(config);

        let mut pe_manager = PeManager::new(&pe_config, mat)?;
        let num_pes = pe_manager.num_pes();
        let mut fiber_cache = FiberCache::new(&cache_config, num_pes, mat)
            .context("fiber_cache configuration")?;
        let mut main_mem = MainMemory::new(&mem_config);
        let cache_mem_ports = fiber_cache.num_mem_ports();
        main_mem.set_num_ports(2 + cache_mem_ports + num_pes);

        connect(pe_manager.mem_read_port_mut(0), main_mem.port_mut(0));
        connect(pe_manager.mem_read_port_mut(1), main_mem.port_mut(1));
        for i in 0..cache_mem_ports {
            connect(fiber_cache.mem_port_mut(i), main_mem.port_mut(i + 2));
        }
        for i in 0..num_pes {
            connect(
                pe_manager.mem_write_port_mut(i),
                main_mem.port_mut(i + cache_mem_ports + 2),
            );
        }
        connect(
            pe_manager.prefetch_port_mut(),
            fiber_cache.prefetch_port_mut(),
        );
        for i in 0..num_pes {
            connect(
                pe_manager.cache_read_port_mut(i),
                fiber_cache.read_port_mut(i),
            );
            connect(
                pe_manager.cache_write_port_mut(i),
                fiber_cache.write_port_mut(i),
            );
        }

        Ok(Gamma {
            pe_manager,
            fiber_cache,
            main_mem,
            cycles: 0,
            period_ns: clock_period_ns(config),
            config_desc: config
                .get("arch")
                .and_then(Value::as_str)
                .unwrap_or("gamma")
                .to_string(),
        })
    }

    fn reset(&mut self, mat: &MatrixData) {
        self.pe_manager.reset(mat);
        self.fiber_cache.reset(mat);
        self.main_mem.reset();
        self.cycles = 0;
    }

    fn print_progress(&self, mat: &MatrixData) {
        if self.pe_manager.stats.num_mults == 0 {
            print!("progress:   0.00%\r");
        } else {
            let progress =
                self.pe_manager.stats.num_mults as f64 / mat.num_mults as f64 * 100.0;
            print!("progress: {:6.2}%\r", progress);
        }
        let _ = std::io::stdout().flush();
    }

    pub fn run_simulation(&mut self, mat: &mut MatrixData, out: &mut dyn Write) -> Result<bool> {
        self.reset(mat);
        loop {
            self.pe_manager.update(mat);
            self.fiber_cache.update();
            self.main_mem.update();
            self.fiber_cache.apply();
            self.pe_manager.apply();
            if self.cycles % PROGRESS_INTERVAL == 0 {
                self.print_progress(mat);
            }
            self.cycles += 1;
            if self.pe_manager.finished(mat)
                && self.fiber_cache.inactive()
                && self.main_mem.inactive()
            {
                break;
            }
        }
        println!("progress: 100.00%");
        // block-unit counters to memory-transaction units
        self.fiber_cache.b_data_reads *= 3;
        self.fiber_cache.c_partial_reads *= 3;
        self.fiber_cache.c_partial_writes *= 3;
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
        let stats = &self.pe_manager.stats;
        if mat.num_mults != stats.num_mults {
            error!("number of multiplications doesn't match the expected value");
        }
        if stats.num_mults - stats.num_adds != mat.c.nnz {
            error!("number of multiplications and additions doesn't match the nnz of the result");
        }
        if self.fiber_cache.b_data_reads < mat.b_data_min_reads_fiber_cache {
            error!("number of B bytes read too small");
        }
        if self.fiber_cache.b_data_reads > mat.b_data_max_reads_fiber_cache {
            error!("number of B bytes read too big");
        }
        if self.fiber_cache.c_partial_reads != self.fiber_cache.c_partial_writes {
            error!("number of C bytes read doesn't match the number of C bytes written");
        }
        if self.main_mem.read_requests
            != self.pe_manager.preproc_a_reads
                + self.fiber_cache.b_data_reads
                + self.fiber_cache.c_partial_reads
        {
            error!("memory reads don't match PE manager and fiber cache reads");
        }
        if self.main_mem.write_requests != stats.c_writes + self.fiber_cache.c_partial_writes {
            error!("memory writes don't match PE manager and fiber cache writes");
        }
    }

    pub fn stats_fingerprint(&self) -> (u64, usize, usize, usize, usize) {
        (
            self.cycles,
            self.pe_manager.stats.num_mults,
            self.pe_manager.stats.num_adds,
            self.main_mem.read_requests,
            self.main_mem.write_requests,
        )
    }

    pub fn pe_stats(&self) -> &pe::PeStats {
        &self.pe_manager.stats
    }

    pub fn cache_stats(&self) -> (usize, usize, usize) {
        (
            self.fiber_cache.b_data_reads,
            self.fiber_cache.c_partial_reads,
            self.fiber_cache.c_partial_writes,
        )
    }

    fn print_stats(&self, mat: &MatrixData, out: &mut dyn Write) -> Result<()> {
        let stats = &self.pe_manager.stats;
        let num_pes = self.pe_manager.num_pes();
        let cycles = self.cycles as usize;
        let exec_time_ns = cycles as f64 * self.period_ns;
        let exec_time_ms = exec_time_ns * 1e-6;
        let gflops = mat.num_mults as f64 / exec_time_ns;
        let idle_ratio = ratio(stats.idle_cycles, cycles * num_pes) * 100.0;
        let b_stall_ratio = ratio(stats.b_data_stalls, cycles * num_pes) * 100.0;
        let write_stall_ratio = ratio(stats.write_stalls, cycles * num_pes) * 100.0;

        let mem_traffic = self.main_mem.read_requests + self.main_mem.write_requests;
        let mem_traffic_bytes = (mem_traffic * MEM_TRANSACTION_SIZE) as f64;
        let bandwidth = mem_traffic_bytes / exec_time_ns;
        let op_intensity = mat.num_mults as f64 / mem_traffic_bytes;
        let cache_bandwidth = ratio(self.fiber_cache.reads + self.fiber_cache.writes, cycles);
        let b_blocks_avg = ratio(self.fiber_cache.b_blocks_avg, self.fiber_cache.num_samples);
        let c_partial_blocks_avg = ratio(
            self.fiber_cache.c_partial_blocks_avg,
            self.fiber_cache.num_samples,
        );
        let free_blocks_avg =
            self.fiber_cache.num_blocks as f64 - b_blocks_avg - c_partial_blocks_avg;
        let preproc_a_bytes_read = mat.preproc_a_bytes();
        let mem_bytes_read = preproc_a_bytes_read
            + (self.fiber_cache.b_data_reads + self.fiber_cache.c_partial_reads)
                * MEM_TRANSACTION_SIZE;
        let c_data_bytes_write = mat.c.nnz * ELEMENT_SIZE;
        let mem_bytes_write =
            c_data_bytes_write + self.fiber_cache.c_partial_writes * MEM_TRANSACTION_SIZE;
        let cache_hit_rate =
            ratio(self.fiber_cache.read_hits, self.fiber_cache.reads) * 100.0;

        writeln!(out, "*---Simulation Results---*")?;
        writeln!(out, "Arch: {}", self.config_desc)?;
        writeln!(out, "Num cycles: {}", self.cycles)?;
        writeln!(out, "Clock period: {} ns", self.period_ns)?;
        writeln!(out, "Execution time: {:.4} ms", exec_time_ms)?;
        writeln!(out, "GFlops: {:.4}", gflops)?;
        writeln!(out, "*---Processing Elements---*")?;
        writeln!(out, "Number flops (mults): {}", mat.num_mults)?;
        writeln!(out, "Number adds : {}", stats.num_adds)?;
        writeln!(
            out,
            "Idle cycles: {} ({:.4}%)",
            stats.idle_cycles, idle_ratio
        )?;
        writeln!(
            out,
            "B data stalls: {} ({:.4}%)",
            stats.b_data_stalls, b_stall_ratio
        )?;
        writeln!(
            out,
            "Write stalls: {} ({:.4}%)",
            stats.write_stalls, write_stall_ratio
        )?;
        writeln!(out, "C partial rows: {}", stats.num_c_partial_rows)?;
        writeln!(out, "C partial elements: {}", stats.num_c_partial_elements)?;
        writeln!(out, "Max bytes write: {}", stats.max_bytes_write)?;
        writeln!(out, "*---Fiber Cache---*")?;
        writeln!(out, "Fiber cache reads: {}", self.fiber_cache.reads)?;
        writeln!(out, "Fiber cache writes: {}", self.fiber_cache.writes)?;
        writeln!(
            out,
            "Fiber cache read hits: {} ({:.4}% hit rate)",
            self.fiber_cache.read_hits, cache_hit_rate
        )?;
        writeln!(
            out,
            "Fiber cache bandwidth: {:.4} blocks/cycle",
            cache_bandwidth
        )?;
        writeln!(
            out,
            "Average B blocks: {:.4} ({:.4}%)",
            b_blocks_avg,
            b_blocks_avg / self.fiber_cache.num_blocks as f64 * 100.0
        )?;
        writeln!(
            out,
            "Average C partial blocks: {:.4} ({:.4}%)",
            c_partial_blocks_avg,
            c_partial_blocks_avg / self.fiber_cache.num_blocks as f64 * 100.0
        )?;
        writeln!(
            out,
            "Average free blocks: {:.4} ({:.4}%)",
            free_blocks_avg,
            free_blocks_avg / self.fiber_cache.num_blocks as f64 * 100.0
        )?;
        writeln!(out, "*---Main Memory---*")?;
        writeln!(out, "Memory bandwidth: {:.4} GB/s", bandwidth)?;
        writeln!(out, "Operational intensity: {:.4} flop/byte", op_intensity)?;
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
            self.pe_manager.preproc_a_reads,
            reqs_to_mb(self.pe_manager.preproc_a_reads),
            unused_bytes_ratio(self.pe_manager.preproc_a_reads, preproc_a_bytes_read)
        )?;
        writeln!(
            out,
            "B data reads: {} ({:.4} MB) (0% unused)",
            self.fiber_cache.b_data_reads,
            reqs_to_mb(self.fiber_cache.b_data_reads)
        )?;
        writeln!(
            out,
            "B data min reads: {} ({:.4} MB)",
            mat.b_data_min_reads_fiber_cache,
            reqs_to_mb(mat.b_data_min_reads_fiber_cache)
        )?;
        writeln!(
            out,
            "B data max reads: {} ({:.4} MB)",
            mat.b_data_max_reads_fiber_cache,
            reqs_to_mb(mat.b_data_max_reads_fiber_cache)
        )?;
        writeln!(
            out,
            "C partial reads/writes: {} ({:.4} MB) (0% unused)",
            self.fiber_cache.c_partial_reads,
            reqs_to_mb(self.fiber_cache.c_partial_reads)
        )?;
        writeln!(
            out,
            "C data writes: {} ({:.4} MB) ({:.4}% unused)",
            stats.c_writes,
            reqs_to_mb(stats.c_writes),
            unused_bytes_ratio(stats.c_writes, c_data_bytes_write)
        )?;
        writeln!(out, "A data bytes read: {}", preproc_a_bytes_read)?;
        writeln!(out, "C data bytes written: {}", c_data_bytes_write)?;
        Ok(())
    }
}
