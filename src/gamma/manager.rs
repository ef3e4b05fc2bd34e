use anyhow::{ensure, Context, Result};

use crate::base::fetcher::ArrayFetcher;
use crate::base::math::{div_ceil, inc_mod, log2_ceil, log_ceil, nearest_pow_floor};
use crate::base::port::{EmptyMsg, Port};
use crate::base::{BLOCK_SIZE_BYTES, ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX, MEM_TRANSACTION_SIZE};
use crate::gamma::pe::{InputFiber, PartialPool, Pe, PeStats, Task};
use crate::matrix::data::MatrixData;
use crate::sim::config::PeManagerConfig;
use crate::sim::mem::{MemPort, MemRequest};

pub type PrefetchPort = Port<usize, EmptyMsg>;

/// Scheduling plan for an A row whose fan-in exceeds the PE radix: level 0
/// consumes leaves into radix-full partials, a pivot second level absorbs
/// the remainder so every later level merges exactly radix partials.
#[derive(Default)]
struct TaskTree {
    tree_level: usize,
    b_rows_first_level: usize,
    b_rows_second_level: usize,
    c_row_idx: u32,
    c_row_ptr: u32,
    num_c_partials_level: Vec<usize>,
    c_partial_fibers: Vec<Option<u32>>,
}

impl TaskTree {
    fn reset(&mut self) {
        self.tree_level = 0;
        self.b_rows_first_level = 0;
        self.b_rows_second_level = 0;
        self.c_row_idx = INVALID_IDX;
        self.c_row_ptr = INVALID_IDX;
        self.num_c_partials_level.clear();
        self.c_partial_fibers.clear();
    }

    fn init(&mut self, num_rows: usize, c_row_idx: u32, c_row_ptr: u32, radix: usize) {
        let mut second_level_num_rows = nearest_pow_floor(num_rows as u64, radix as u64) as usize;
        if second_level_num_rows == num_rows {
            // exact powers route every leaf through the first level
            second_level_num_rows /= radix;
        }
        self.b_rows_first_level = div_ceil(
            ((num_rows - second_level_num_rows) * radix) as u64,
            radix as u64 - 1,
        ) as usize;
        self.b_rows_second_level = num_rows - self.b_rows_first_level;
        let num_levels = log_ceil(num_rows as u64, radix as u64) as usize;
        self.num_c_partials_level = vec![0; num_levels];
        self.c_partial_fibers = vec![None; num_levels * radix];
        self.c_row_idx = c_row_idx;
        self.c_row_ptr = c_row_ptr;
    }

    fn valid(&self) -> bool {
        !self.num_c_partials_level.is_empty()
    }
}

/// PE array plus the shared partial-fiber pool and the task-tree scheduler.
pub struct PeManager {
    mem_read_ports: Vec<MemPort>,
    mem_write_ports: Vec<MemPort>,
    cache_read_ports: Vec<MemPort>,
    cache_write_ports: Vec<MemPort>,
    prefetch_port: PrefetchPort,

    a_row_ptr_fetcher: ArrayFetcher<u32>,
    a_row_idx_fetcher: ArrayFetcher<u32>,
    c_row_ptr_fetcher: ArrayFetcher<u32>,
    a_values_fetcher: ArrayFetcher<f64>,
    b_row_ptr_end_fetcher: ArrayFetcher<(u32, u32)>,
    read_arbiter: usize,
    num_elements_prefetch: usize,

    pes: Vec<Pe>,
    pool: PartialPool,
    task_tree: TaskTree,
    pub stats: PeStats,
    pub preproc_a_reads: usize,

    radix: usize,
    prefetched_rows_per_cycle: usize,
}

impl PeManager {
    pub fn new(config: &PeManagerConfig, mat: &MatrixData) -> Result<Self> {
        let num_pes = config.num_pes.context("missing key PE_manager.num_PEs")?;
        let radix = config.pe_radix.context("missing key PE_manager.PE_radix")?;
        ensure!(radix >= 2, "PE_radix must be at least 2");
        let task_tree_max_level = 32 / log2_ceil(radix as u64) as usize;
        let max_partial_fibers = (task_tree_max_level * radix).max(2 * num_pes);

        let mut manager = PeManager {
            mem_read_ports: (0..2).map(|_| Port::new()).collect(),
            mem_write_ports: (0..num_pes).map(|_| Port::new()).collect(),
            cache_read_ports: (0..num_pes).map(|_| Port::new()).collect(),
            cache_write_ports: (0..num_pes).map(|_| Port::new()).collect(),
            prefetch_port: Port::new(),
            a_row_ptr_fetcher: ArrayFetcher::new(mat.preproc_a_row_ptr.clone()),
            a_row_idx_fetcher: ArrayFetcher::new(mat.preproc_a_row_idx.clone()),
            c_row_ptr_fetcher: ArrayFetcher::new(mat.preproc_c_row_ptr.clone()),
            a_values_fetcher: ArrayFetcher::new(mat.preproc_a_values.clone()),
            b_row_ptr_end_fetcher: ArrayFetcher::new(mat.preproc_b_row_ptr_end.clone()),
            read_arbiter: usize::MAX,
            num_elements_prefetch: 0,
            pes: (0..num_pes)
                .map(|_| {
                    Pe::new(
                        radix,
                        config.pe_input_buffer_size,
                        config.pe_output_buffer_size,
                    )
                })
                .collect(),
            pool: PartialPool::new(max_partial_fibers),
            task_tree: TaskTree::default(),
            stats: PeStats::default(),
            preproc_a_reads: 0,
            radix,
            prefetched_rows_per_cycle: config.prefetched_rows_per_cycle,
        };
        manager.a_row_ptr_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.a_row_idx_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.c_row_ptr_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.a_values_fetcher.buffer_size = config.a_values_buffer_size;
        manager.b_row_ptr_end_fetcher.buffer_size = config.b_row_ptr_end_buffer_size;
        Ok(manager)
    }

    pub fn num_pes(&self) -> usize {
        self.pes.len()
    }

    pub fn mem_read_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.mem_read_ports[id]
    }

    pub fn mem_write_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.mem_write_ports[id]
    }

    pub fn cache_read_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.cache_read_ports[id]
    }

    pub fn cache_write_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.cache_write_ports[id]
    }

    pub fn prefetch_port_mut(&mut self) -> &mut PrefetchPort {
        &mut self.prefetch_port
    }

    pub fn reset(&mut self, mat: &MatrixData) {
        for port in &mut self.mem_read_ports {
            port.reset();
        }
        for port in &mut self.mem_write_ports {
            port.reset();
        }
        for port in &mut self.cache_read_ports {
            port.reset();
        }
        for port in &mut self.cache_write_ports {
            port.reset();
        }
        self.prefetch_port.reset();
        self.a_row_ptr_fetcher
            .reset(mat.preproc_a_row_ptr.clone(), mat.preproc_a_row_ptr_addr);
        self.a_row_idx_fetcher
            .reset(mat.preproc_a_row_idx.clone(), mat.preproc_a_row_idx_addr);
        self.c_row_ptr_fetcher
            .reset(mat.preproc_c_row_ptr.clone(), mat.c_row_ptr_addr);
        self.a_values_fetcher
            .reset(mat.preproc_a_values.clone(), mat.preproc_a_values_addr);
        self.b_row_ptr_end_fetcher.reset(
            mat.preproc_b_row_ptr_end.clone(),
            mat.preproc_b_row_ptr_end_addr,
        );
        self.read_arbiter = usize::MAX;
        self.num_elements_prefetch = 0;
        for pe in &mut self.pes {
            pe.reset();
        }
        self.pool.reset(mat.c_partials_base_addr);
        self.task_tree.reset();
        self.stats = PeStats::default();
        self.preproc_a_reads = 0;
    }

    pub fn update(&mut self, mat: &mut MatrixData) {
        // one request for one of the small preprocessed-A arrays
        if !self.mem_read_ports[0].has_msg_send() {
            for _ in 0..4 {
                self.read_arbiter = inc_mod(self.read_arbiter, 4);
                let address = match self.read_arbiter {
                    0 => self.a_row_ptr_fetcher.get_fetch_address(),
                    1 => self.a_row_idx_fetcher.get_fetch_address(),
                    2 => self.c_row_ptr_fetcher.get_fetch_address(),
                    _ => self.a_values_fetcher.get_fetch_address(),
                };
                if address != INVALID_ADDR {
                    self.mem_read_ports[0]
                        .add_msg_send(MemRequest::read(address, self.read_arbiter as u32));
                    self.preproc_a_reads += 1;
                    break;
                }
            }
        }
        // B_row_ptr_end stream has its own port
        if !self.mem_read_ports[1].has_msg_send() {
            let address = self.b_row_ptr_end_fetcher.get_fetch_address();
            if address != INVALID_ADDR {
                self.mem_read_ports[1].add_msg_send(MemRequest::read(address, 0));
                self.preproc_a_reads += 1;
            }
        }
        // tell the cache how many B rows just became schedulable
        if !self.prefetch_port.has_msg_send() {
            let n = self
                .num_elements_prefetch
                .min(self.prefetched_rows_per_cycle);
            self.num_elements_prefetch -= n;
            self.prefetch_port.add_msg_send(n);
        }
        // one cache-line request per PE
        for i in 0..self.pes.len() {
            if self.cache_read_ports[i].has_msg_send() {
                continue;
            }
            let req = self.pes[i].get_cache_request(mat, &mut self.pool, &mut self.stats);
            if req.valid() {
                self.cache_read_ports[i].add_msg_send(req);
            }
        }
        self.write_data(mat);
        for pe in &mut self.pes {
            pe.update(mat, &mut self.pool, &mut self.stats);
        }
        self.allocate_tasks();
        for port in &mut self.mem_read_ports {
            port.transfer();
        }
        for port in &mut self.mem_write_ports {
            port.transfer();
        }
        for port in &mut self.cache_read_ports {
            port.transfer();
        }
        for port in &mut self.cache_write_ports {
            port.transfer();
        }
        self.prefetch_port.transfer();
    }

    pub fn apply(&mut self) {
        if let Some(resp) = self.mem_read_ports[0].take_msg_received() {
            debug_assert!(resp.id < 4);
            match resp.id {
                0 => self.a_row_ptr_fetcher.receive_data(resp.address),
                1 => self.a_row_idx_fetcher.receive_data(resp.address),
                2 => self.c_row_ptr_fetcher.receive_data(resp.address),
                _ => self.a_values_fetcher.receive_data(resp.address),
            };
        }
        if let Some(resp) = self.mem_read_ports[1].take_msg_received() {
            self.num_elements_prefetch += self.b_row_ptr_end_fetcher.receive_data(resp.address);
        }
        for i in 0..self.pes.len() {
            if let Some(resp) = self.cache_read_ports[i].take_msg_received() {
                self.pes[i].receive_cache_response(resp);
            }
        }
    }

    pub fn finished(&self, mat: &MatrixData) -> bool {
        if self.stats.num_finished_rows < mat.preproc_a_row_idx.len() {
            return false;
        }
        self.pes.iter().all(|pe| pe.num_bytes_write == 0)
    }

    /// Drain accumulated output bytes to memory (final rows) or the cache
    /// (partial fibers), one transaction or block at a time, and roll the
    /// staged next task in once the current one is fully written.
    fn write_data(&mut self, mat: &MatrixData) {
        for i in 0..self.pes.len() {
            let pe = &mut self.pes[i];
            if !pe.cur_task.valid() {
                continue;
            }
            if pe.write_address == INVALID_ADDR {
                pe.write_address = match pe.cur_task.c_partial {
                    Some(p) => self.pool.get(p).begin,
                    None => mat.c_elements_addr + pe.cur_task.c_row_ptr as u64 * ELEMENT_SIZE as u64,
                };
            }
            match pe.cur_task.c_partial {
                Some(p) => {
                    if self.cache_write_ports[i].has_msg_send() {
                        continue;
                    }
                    let mut num_bytes_write =
                        BLOCK_SIZE_BYTES - (pe.write_address % BLOCK_SIZE_BYTES as u64) as usize;
                    if pe.cur_task_finished {
                        debug_assert!(pe.num_bytes_write > 0);
                        num_bytes_write = num_bytes_write.min(pe.num_bytes_write);
                    }
                    if pe.num_bytes_write < num_bytes_write {
                        continue;
                    }
                    self.cache_write_ports[i].add_msg_send(MemRequest::write(pe.write_address));
                    pe.write_address += num_bytes_write as u64;
                    pe.num_bytes_write -= num_bytes_write;
                    self.pool.get_mut(p).end += num_bytes_write as u64;
                }
                None => {
                    if self.mem_write_ports[i].has_msg_send() {
                        continue;
                    }
                    let mut num_bytes_write = MEM_TRANSACTION_SIZE
                        - (pe.write_address % MEM_TRANSACTION_SIZE as u64) as usize;
                    if pe.cur_task_finished {
                        debug_assert!(pe.num_bytes_write > 0);
                        num_bytes_write = num_bytes_write.min(pe.num_bytes_write);
                    }
                    if pe.num_bytes_write < num_bytes_write {
                        continue;
                    }
                    self.mem_write_ports[i].add_msg_send(MemRequest::write(pe.write_address));
                    self.stats.c_writes += 1;
                    pe.write_address += num_bytes_write as u64;
                    pe.num_bytes_write -= num_bytes_write;
                }
            }
            // switch to the staged task once all bytes are out
            if pe.cur_task_finished && pe.num_bytes_write == 0 {
                if pe.next_task.valid() {
                    pe.cur_task = std::mem::take(&mut pe.next_task);
                    pe.write_address = match pe.cur_task.c_partial {
                        Some(p) => self.pool.get(p).begin,
                        None => {
                            mat.c_elements_addr + pe.cur_task.c_row_ptr as u64 * ELEMENT_SIZE as u64
                        }
                    };
                    // elements fetched for this task while it was staged
                    for buffer in &mut pe.input_buffers {
                        debug_assert!(buffer.num_elems_fetched_cur_task == 0);
                        buffer.num_elems_fetched_cur_task = buffer.col_idx.len();
                    }
                    pe.cur_task_finished = false;
                } else {
                    pe.cur_task = Task::default();
                    pe.cur_task_finished = false;
                    pe.write_address = INVALID_ADDR;
                }
            }
        }
    }

    fn allocate_tasks(&mut self) {
        for i in 0..self.pes.len() {
            if !self.pes[i].cur_task.valid() {
                let task = self.get_new_task();
                if !task.valid() {
                    return;
                }
                self.pes[i].cur_task = task;
            }
        }
        for i in 0..self.pes.len() {
            if !self.pes[i].next_task.valid() {
                let task = self.get_new_task();
                if !task.valid() {
                    return;
                }
                self.pes[i].next_task = task;
            }
        }
    }

    fn get_b_input_fiber(&mut self) -> InputFiber {
        debug_assert!(self.b_row_ptr_end_fetcher.num_elements > 0);
        debug_assert!(self.a_values_fetcher.num_elements > 0);
        let (b_row_ptr, b_row_end) = self.b_row_ptr_end_fetcher.front();
        let input = InputFiber {
            a_value: self.a_values_fetcher.front(),
            b_row_ptr,
            b_row_end,
            c_partial: None,
        };
        self.a_values_fetcher.pop();
        self.b_row_ptr_end_fetcher.pop();
        input
    }

    /// Produce the next task, either a flat merge of one A row or the next
    /// step of the active task tree. Returns an invalid task when a resource
    /// guard fails; the caller retries next cycle.
    fn get_new_task(&mut self) -> Task {
        if !self.task_tree.valid() {
            if self.a_row_idx_fetcher.finished() {
                return Task::default();
            }
            if self.a_row_ptr_fetcher.num_elements < 2
                || self.a_row_idx_fetcher.num_elements == 0
                || self.c_row_ptr_fetcher.num_elements == 0
            {
                return Task::default();
            }
            let a_row_idx = self.a_row_idx_fetcher.front();
            let c_row_ptr = self.c_row_ptr_fetcher.front();
            let num_rows_merge =
                (self.a_row_ptr_fetcher.at(1) - self.a_row_ptr_fetcher.front()) as usize;
            if num_rows_merge <= self.radix {
                if self.a_values_fetcher.num_elements < num_rows_merge
                    || self.b_row_ptr_end_fetcher.num_elements < num_rows_merge
                {
                    return Task::default();
                }
                let mut task = Task {
                    c_row_idx: a_row_idx,
                    c_row_ptr,
                    ..Default::default()
                };
                for _ in 0..num_rows_merge {
                    let input = self.get_b_input_fiber();
                    task.inputs.push(input);
                }
                self.a_row_ptr_fetcher.pop();
                self.a_row_idx_fetcher.pop();
                self.c_row_ptr_fetcher.pop();
                return task;
            }
            self.a_row_ptr_fetcher.pop();
            self.a_row_idx_fetcher.pop();
            self.c_row_ptr_fetcher.pop();
            self.task_tree
                .init(num_rows_merge, a_row_idx, c_row_ptr, self.radix);
        }
        debug_assert!(self.task_tree.valid());
        let last_level = self.task_tree.num_c_partials_level.len() - 1;
        if self.task_tree.tree_level == 0 {
            debug_assert!(self.task_tree.b_rows_first_level > 0);
            if self.pool.is_full() {
                return Task::default();
            }
            let b_rows_merge = self.task_tree.b_rows_first_level.min(self.radix);
            if self.a_values_fetcher.num_elements < b_rows_merge
                || self.b_row_ptr_end_fetcher.num_elements < b_rows_merge
            {
                return Task::default();
            }
            self.task_tree.b_rows_first_level -= b_rows_merge;
            let c_partial = self.pool.alloc().expect("pool full check passed");
            let slot = self.task_tree.num_c_partials_level[0];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            let mut task = Task {
                c_partial: Some(c_partial),
                ..Default::default()
            };
            for _ in 0..b_rows_merge {
                let input = self.get_b_input_fiber();
                task.inputs.push(input);
            }
            self.task_tree.num_c_partials_level[0] += 1;
            if self.task_tree.num_c_partials_level[0] == self.radix
                || self.task_tree.b_rows_first_level == 0
            {
                self.task_tree.tree_level = 1;
            }
            return task;
        }
        if self.task_tree.tree_level == 1 {
            if self.task_tree.tree_level == last_level {
                debug_assert!(
                    self.task_tree.b_rows_second_level + self.task_tree.num_c_partials_level[0]
                        == self.radix
                );
                if self.a_values_fetcher.num_elements < self.task_tree.b_rows_second_level
                    || self.b_row_ptr_end_fetcher.num_elements
                        < self.task_tree.b_rows_second_level
                {
                    return Task::default();
                }
                let mut task = Task {
                    c_row_idx: self.task_tree.c_row_idx,
                    c_row_ptr: self.task_tree.c_row_ptr,
                    ..Default::default()
                };
                for i in 0..self.task_tree.num_c_partials_level[0] {
                    let fiber = self.task_tree.c_partial_fibers[i]
                        .take()
                        .expect("level-0 partial missing");
                    task.inputs.push(InputFiber::from_partial(fiber));
                }
                for _ in 0..self.task_tree.b_rows_second_level {
                    let input = self.get_b_input_fiber();
                    task.inputs.push(input);
                }
                self.task_tree.reset();
                return task;
            }
            if self.pool.is_full() {
                return Task::default();
            }
            let b_rows_merge = self.radix - self.task_tree.num_c_partials_level[0];
            if self.a_values_fetcher.num_elements < b_rows_merge
                || self.b_row_ptr_end_fetcher.num_elements < b_rows_merge
            {
                return Task::default();
            }
            let c_partial = self.pool.alloc().expect("pool full check passed");
            let slot = self.radix + self.task_tree.num_c_partials_level[1];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            let mut task = Task {
                c_partial: Some(c_partial),
                ..Default::default()
            };
            for i in 0..self.task_tree.num_c_partials_level[0] {
                let fiber = self.task_tree.c_partial_fibers[i]
                    .take()
                    .expect("level-0 partial missing");
                task.inputs.push(InputFiber::from_partial(fiber));
            }
            for _ in 0..b_rows_merge {
                let input = self.get_b_input_fiber();
                task.inputs.push(input);
            }
            self.task_tree.num_c_partials_level[0] = 0;
            self.task_tree.num_c_partials_level[1] += 1;
            if self.task_tree.num_c_partials_level[1] == self.radix {
                self.task_tree.tree_level += 1;
            } else if self.task_tree.b_rows_first_level > 0 {
                self.task_tree.tree_level = 0;
            }
            return task;
        }
        if self.task_tree.tree_level < last_level {
            debug_assert!(
                self.task_tree.num_c_partials_level[self.task_tree.tree_level - 1] == self.radix
            );
            if self.pool.is_full() {
                return Task::default();
            }
            let c_partial = self.pool.alloc().expect("pool full check passed");
            let level = self.task_tree.tree_level;
            let slot = self.radix * level + self.task_tree.num_c_partials_level[level];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            let mut task = Task {
                c_partial: Some(c_partial),
                ..Default::default()
            };
            for i in 0..self.radix {
                let fiber = self.task_tree.c_partial_fibers[(level - 1) * self.radix + i]
                    .take()
                    .expect("lower-level partial missing");
                task.inputs.push(InputFiber::from_partial(fiber));
            }
            self.task_tree.num_c_partials_level[level - 1] = 0;
            self.task_tree.num_c_partials_level[level] += 1;
            if self.task_tree.num_c_partials_level[level] == self.radix {
                self.task_tree.tree_level += 1;
            } else if self.task_tree.b_rows_first_level > 0 {
                self.task_tree.tree_level = 0;
            } else {
                self.task_tree.tree_level = 1;
            }
            return task;
        }
        // top level: merge the last radix partials into the final C row
        debug_assert!(
            self.task_tree.num_c_partials_level[self.task_tree.tree_level - 1] == self.radix
        );
        let mut task = Task {
            c_row_idx: self.task_tree.c_row_idx,
            c_row_ptr: self.task_tree.c_row_ptr,
            ..Default::default()
        };
        let level = self.task_tree.tree_level;
        for i in 0..self.radix {
            let fiber = self.task_tree.c_partial_fibers[(level - 1) * self.radix + i]
                .take()
                .expect("lower-level partial missing");
            task.inputs.push(InputFiber::from_partial(fiber));
        }
        self.task_tree.reset();
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_tree_split_matches_closed_form() {
        let mut tree = TaskTree::default();
        // radix 4, 5 rows: pivot power 4, first level ceil(1*4/3) = 2
        tree.init(5, 0, 0, 4);
        assert_eq!(tree.b_rows_first_level, 2);
        assert_eq!(tree.b_rows_second_level, 3);
        assert_eq!(tree.num_c_partials_level.len(), 2);
        assert_eq!(
            tree.b_rows_first_level + tree.b_rows_second_level,
            5,
            "level split must conserve rows"
        );

        // radix 4, 16 rows: a perfect power routes every row through level 0
        tree.reset();
        tree.init(16, 0, 0, 4);
        assert_eq!(tree.b_rows_first_level, 16);
        assert_eq!(tree.b_rows_second_level, 0);
        assert_eq!(tree.num_c_partials_level.len(), 2);

        // radix 4, 21 rows: 3 levels
        tree.reset();
        tree.init(21, 0, 0, 4);
        assert_eq!(tree.num_c_partials_level.len(), 3);
        assert_eq!(tree.b_rows_first_level + tree.b_rows_second_level, 21);
        assert_eq!(tree.b_rows_first_level, div_ceil((21 - 16) * 4, 3) as usize);
    }
}
