use std::collections::VecDeque;
use std::mem;

use anyhow::{ensure, Context, Result};

use crate::base::fetcher::ArrayFetcher;
use crate::base::math::{div_ceil, inc_mod, log2_ceil, log_ceil, nearest_pow_floor};
use crate::base::port::{EmptyMsg, Port};
use crate::base::{ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX};
use crate::forest::tree::{
    do_merge_add, fiber_buffer_transfer, write_c_output, CPartialFiber, FiberBuffer, InputFiber,
    MergeTree, TaskOutput, TreeCtx,
};
use crate::forest::{CacheRead, CacheResponse, CacheWrite, CacheWriteKind, ForestParams,
    ForestStats, PrefetchedRow};
use crate::matrix::data::MatrixData;
use crate::sim::config::MergeTreeConfig;
use crate::sim::mem::{MemPort, MemRequest};

pub type PrefetchPort = Port<EmptyMsg, Vec<PrefetchedRow>>;
pub type CacheReadPort = Port<CacheRead, CacheResponse>;
pub type CacheWritePort = Port<CacheWrite, u32>;

/// Reference to a fiber stream feeding a dynamic node: either the root of
/// merge tree `index` at rotation `task_idx`, or dynamic node `index`
/// (`task_idx` sentinel).
#[derive(Debug, Clone, Copy)]
pub struct FiberSource {
    pub index: u32,
    pub task_idx: u32,
}

impl Default for FiberSource {
    fn default() -> Self {
        FiberSource {
            index: INVALID_IDX,
            task_idx: INVALID_IDX,
        }
    }
}

impl FiberSource {
    fn valid(&self) -> bool {
        self.index != INVALID_IDX
    }

    fn merge_tree_src(&self) -> bool {
        self.task_idx != INVALID_IDX
    }
}

/// Shared upper-layer merger pairing two sources into one stream.
#[derive(Debug, Default)]
pub struct DynamicNode {
    pub data: FiberBuffer,
    pub src1: FiberSource,
    pub src2: FiberSource,
    pub output: TaskOutput,
}

impl DynamicNode {
    fn empty(&self) -> bool {
        self.data.finished() && !self.output.valid()
    }
}

/// In-flight task being spread over trees and dynamic nodes. Sources carry
/// their merge depth so equal-depth pairs merge first, keeping the dynamic
/// layer balanced.
#[derive(Default)]
struct TaskAllocator {
    num_b_rows: usize,
    c_partial_fibers: Vec<u32>,
    trees_allocated: Vec<bool>,
    allocated_sources: Vec<(FiberSource, u32)>,
    output: TaskOutput,
}

impl TaskAllocator {
    fn empty(&self) -> bool {
        self.num_b_rows == 0 && self.c_partial_fibers.is_empty() && self.allocated_sources.is_empty()
    }

    fn reset(&mut self) {
        self.num_b_rows = 0;
        self.c_partial_fibers.clear();
        self.trees_allocated.fill(false);
        self.allocated_sources.clear();
        self.output = TaskOutput::default();
    }

    fn all_rows_allocated(&self) -> bool {
        self.num_b_rows == 0 && self.c_partial_fibers.is_empty()
    }

    fn last_merge(&self) -> bool {
        self.allocated_sources.len() == 2 && self.all_rows_allocated()
    }
}

/// Decomposition plan for an A row wider than the whole forest.
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
    fn empty(&self) -> bool {
        self.num_c_partials_level.is_empty()
    }

    fn reset(&mut self) {
        self.tree_level = 0;
        self.b_rows_first_level = 0;
        self.b_rows_second_level = 0;
        self.c_row_idx = INVALID_IDX;
        self.c_row_ptr = INVALID_IDX;
        self.num_c_partials_level.clear();
        self.c_partial_fibers.clear();
    }

    fn init(&mut self, num_rows: usize, c_row_idx: u32, c_row_ptr: u32, max_rows_merge: usize) {
        let mut second_level_num_rows =
            nearest_pow_floor(num_rows as u64, max_rows_merge as u64) as usize;
        if second_level_num_rows == num_rows {
            // exact powers route every leaf through the first level
            second_level_num_rows /= max_rows_merge;
        }
        self.b_rows_first_level = div_ceil(
            ((num_rows - second_level_num_rows) * max_rows_merge) as u64,
            max_rows_merge as u64 - 1,
        ) as usize;
        self.b_rows_second_level = num_rows - self.b_rows_first_level;
        let num_levels = log_ceil(num_rows as u64, max_rows_merge as u64) as usize;
        self.num_c_partials_level = vec![0; num_levels];
        self.c_partial_fibers = vec![None; num_levels * max_rows_merge];
        self.c_row_idx = c_row_idx;
        self.c_row_ptr = c_row_ptr;
    }
}

fn take_source(trees: &mut [MergeTree], nodes: &mut [DynamicNode], src: FiberSource) -> FiberBuffer {
    if src.merge_tree_src() {
        mem::take(&mut trees[src.index as usize].levels[0].nodes[0])
    } else {
        mem::take(&mut nodes[src.index as usize].data)
    }
}

fn put_source(
    trees: &mut [MergeTree],
    nodes: &mut [DynamicNode],
    src: FiberSource,
    buf: FiberBuffer,
) {
    if src.merge_tree_src() {
        trees[src.index as usize].levels[0].nodes[0] = buf;
    } else {
        nodes[src.index as usize].data = buf;
    }
}

/// K merge trees plus K-1 dynamic mergers, the partial-fiber pool, and the
/// task allocation machinery.
pub struct MergeTreeManager {
    mem_read_port: MemPort,
    prefetch_port: PrefetchPort,
    cache_read_ports: Vec<CacheReadPort>,
    cache_write_port: CacheWritePort,
    mem_write_ports: Vec<MemPort>,

    a_row_ptr_fetcher: ArrayFetcher<u32>,
    a_row_idx_fetcher: ArrayFetcher<u32>,
    c_row_ptr_fetcher: ArrayFetcher<u32>,
    a_values_fetcher: ArrayFetcher<f64>,
    read_arbiter: usize,
    prefetched_b_rows: VecDeque<PrefetchedRow>,

    merge_trees: Vec<MergeTree>,
    dyn_nodes: Vec<DynamicNode>,
    c_partial_fibers: Vec<CPartialFiber>,
    task_allocator: TaskAllocator,
    task_tree: TaskTree,
    c_partial_write_idx: u32,
    c_partial_head_fiber: Option<u32>,
    write_arbiter: usize,

    pub params: ForestParams,
    pub stats: ForestStats,
}

impl MergeTreeManager {
    pub fn new(config: &MergeTreeConfig, mat: &MatrixData) -> Result<Self> {
        let num_merge_trees = config
            .num_merge_trees
            .context("missing key merge_tree_manager.num_merge_trees")?;
        let merge_tree_size = config
            .merge_tree_size
            .context("missing key merge_tree_manager.merge_tree_size")?;
        let merge_tree_merger_width = config
            .merge_tree_merger_width
            .context("missing key merge_tree_manager.merge_tree_merger_width")?;
        let num_final_mergers = config
            .num_final_mergers
            .context("missing key merge_tree_manager.num_final_mergers")?;
        let dyn_merger_width = config
            .final_merger_width
            .context("missing key merge_tree_manager.final_merger_width")?;
        let num_mem_ports = config
            .num_mem_ports
            .context("missing key merge_tree_manager.num_mem_ports")?;
        ensure!(num_merge_trees >= 2, "num_merge_trees must be at least 2");
        ensure!(merge_tree_size >= 2, "merge_tree_size must be at least 2");

        let max_rows_merge = num_merge_trees * merge_tree_size;
        let task_tree_max_level = 32 / log2_ceil(max_rows_merge as u64) as usize;
        let max_partial_rows = task_tree_max_level * max_rows_merge;
        let params = ForestParams {
            max_prefetched_rows: config.max_prefetched_rows,
            merge_tree_size,
            max_rows_merge,
            merge_tree_merger_width,
            merge_tree_merger_num_adds: config
                .merge_tree_merger_num_adds
                .unwrap_or(merge_tree_merger_width - 1),
            num_final_mergers,
            dyn_merger_width,
            dyn_merger_num_adds: config
                .merge_tree_merger_num_adds
                .unwrap_or(dyn_merger_width - 1),
            input_buffer_size: config.input_buffer_size_or_default(),
            output_buffer_size: config.output_buffer_size.unwrap_or(2 * dyn_merger_width),
        };
        ensure!(
            params.output_buffer_size >= merge_tree_merger_width.max(dyn_merger_width),
            "output_buffer_size smaller than a merger width"
        );

        let mut manager = MergeTreeManager {
            mem_read_port: Port::new(),
            prefetch_port: Port::new(),
            cache_read_ports: (0..num_merge_trees).map(|_| Port::new()).collect(),
            cache_write_port: Port::new(),
            mem_write_ports: (0..num_mem_ports).map(|_| Port::new()).collect(),
            a_row_ptr_fetcher: ArrayFetcher::new(mat.preproc_a_row_ptr.clone()),
            a_row_idx_fetcher: ArrayFetcher::new(mat.preproc_a_row_idx.clone()),
            c_row_ptr_fetcher: ArrayFetcher::new(mat.preproc_c_row_ptr.clone()),
            a_values_fetcher: ArrayFetcher::new(mat.preproc_a_values.clone()),
            read_arbiter: usize::MAX,
            prefetched_b_rows: VecDeque::new(),
            merge_trees: (0..num_merge_trees)
                .map(|_| MergeTree::new(merge_tree_size))
                .collect(),
            dyn_nodes: (0..num_merge_trees - 1).map(|_| DynamicNode::default()).collect(),
            c_partial_fibers: vec![CPartialFiber::default(); max_partial_rows],
            task_allocator: TaskAllocator {
                trees_allocated: vec![false; num_merge_trees],
                ..Default::default()
            },
            task_tree: TaskTree::default(),
            c_partial_write_idx: INVALID_IDX,
            c_partial_head_fiber: None,
            write_arbiter: usize::MAX,
            params,
            stats: ForestStats::default(),
        };
        manager.a_row_ptr_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.a_row_idx_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.c_row_ptr_fetcher.buffer_size = config.a_row_ptr_buffer_size;
        manager.a_values_fetcher.buffer_size = config.max_prefetched_rows;
        Ok(manager)
    }

    pub fn num_mem_ports(&self) -> usize {
        self.mem_write_ports.len()
    }

    pub fn num_cache_read_ports(&self) -> usize {
        self.cache_read_ports.len()
    }

    pub fn mem_read_port_mut(&mut self) -> &mut MemPort {
        &mut self.mem_read_port
    }

    pub fn prefetch_port_mut(&mut self) -> &mut PrefetchPort {
        &mut self.prefetch_port
    }

    pub fn cache_read_port_mut(&mut self, id: usize) -> &mut CacheReadPort {
        &mut self.cache_read_ports[id]
    }

    pub fn cache_write_port_mut(&mut self) -> &mut CacheWritePort {
        &mut self.cache_write_port
    }

    pub fn mem_write_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.mem_write_ports[id]
    }

    pub fn reset(&mut self, mat: &MatrixData) {
        self.mem_read_port.reset();
        self.prefetch_port.reset();
        for port in &mut self.cache_read_ports {
            port.reset();
        }
        self.cache_write_port.reset();
        for port in &mut self.mem_write_ports {
            port.reset();
        }
        self.a_row_ptr_fetcher
            .reset(mat.preproc_a_row_ptr.clone(), mat.preproc_a_row_ptr_addr);
        self.a_row_idx_fetcher
            .reset(mat.preproc_a_row_idx.clone(), mat.preproc_a_row_idx_addr);
        self.c_row_ptr_fetcher
            .reset(mat.preproc_c_row_ptr.clone(), mat.c_row_ptr_addr);
        self.a_values_fetcher
            .reset(mat.preproc_a_values.clone(), mat.preproc_a_values_addr);
        self.read_arbiter = usize::MAX;
        self.prefetched_b_rows.clear();
        for tree in &mut self.merge_trees {
            tree.reset();
        }
        for node in &mut self.dyn_nodes {
            *node = DynamicNode::default();
        }
        self.c_partial_fibers.fill(CPartialFiber::default());
        self.task_allocator.reset();
        self.task_tree.reset();
        self.c_partial_write_idx = INVALID_IDX;
        self.c_partial_head_fiber = None;
        self.write_arbiter = usize::MAX;
        self.stats = ForestStats::default();
    }

    pub fn update(&mut self, mat: &mut MatrixData) {
        self.write_c_data();
        self.write_c_partial_data();
        self.update_dynamic_nodes(mat);
        self.update_merge_trees(mat);
        self.allocate_task();
        self.get_new_task(mat);
        self.send_a_data_request();
        self.send_cache_read_requests();

        self.mem_read_port.transfer();
        for port in &mut self.cache_read_ports {
            port.transfer();
        }
        for port in &mut self.mem_write_ports {
            port.transfer();
        }
        self.cache_write_port.transfer();
    }

    pub fn apply(&mut self) {
        self.receive_a_data();
        self.receive_prefetch_data();
        self.receive_cache_data();
    }

    pub fn finished(&self, mat: &MatrixData) -> bool {
        if self.stats.num_mults != mat.num_mults {
            return false;
        }
        debug_assert!(self.a_row_idx_fetcher.finished());
        debug_assert!(self.c_row_ptr_fetcher.finished());
        debug_assert!(self.a_values_fetcher.finished());
        debug_assert!(self.prefetched_b_rows.is_empty());
        if !self.merge_trees.iter().all(MergeTree::inactive) {
            return false;
        }
        self.dyn_nodes.iter().all(DynamicNode::empty)
    }

    fn send_a_data_request(&mut self) {
        if self.mem_read_port.has_msg_send() {
            return;
        }
        for _ in 0..4 {
            self.read_arbiter = inc_mod(self.read_arbiter, 4);
            let address = match self.read_arbiter {
                0 => self.a_row_ptr_fetcher.get_fetch_address(),
                1 => self.a_row_idx_fetcher.get_fetch_address(),
                2 => self.c_row_ptr_fetcher.get_fetch_address(),
                _ => self.a_values_fetcher.get_fetch_address(),
            };
            if address != INVALID_ADDR {
                self.mem_read_port
                    .add_msg_send(MemRequest::read(address, self.read_arbiter as u32));
                self.stats.preproc_a_reads += 1;
                return;
            }
        }
    }

    fn send_cache_read_requests(&mut self) {
        for i in 0..self.cache_read_ports.len() {
            if self.cache_read_ports[i].has_msg_send() {
                continue;
            }
            let request = self.merge_trees[i].get_request(&self.params, &self.c_partial_fibers);
            if request.valid() {
                self.cache_read_ports[i].add_msg_send(request);
            }
        }
    }

    /// Drain final-row output streams to memory, round-robin over trees and
    /// dynamic nodes.
    fn write_c_data(&mut self) {
        let size = self.merge_trees.len() + self.dyn_nodes.len();
        for port_idx in 0..self.mem_write_ports.len() {
            if self.mem_write_ports[port_idx].has_msg_send() {
                continue;
            }
            for _ in 0..size {
                self.write_arbiter = inc_mod(self.write_arbiter, size);
                let address = if self.write_arbiter < self.merge_trees.len() {
                    self.merge_trees[self.write_arbiter].get_c_write_address()
                } else {
                    self.dyn_nodes[self.write_arbiter - self.merge_trees.len()]
                        .output
                        .get_c_write_address()
                };
                if address == INVALID_ADDR {
                    continue;
                }
                self.stats.c_writes += 1;
                self.mem_write_ports[port_idx].add_msg_send(MemRequest::write(address));
                break;
            }
        }
    }

    /// Exactly one partial-fiber row streams to the cache at a time.
    fn write_c_partial_data(&mut self) {
        if self.c_partial_write_idx == INVALID_IDX || self.cache_write_port.has_msg_send() {
            return;
        }
        let idx = self.c_partial_write_idx as usize;
        let cache_write = if idx < self.merge_trees.len() {
            self.merge_trees[idx].get_c_partial_write(&self.c_partial_fibers)
        } else {
            self.dyn_nodes[idx - self.merge_trees.len()]
                .output
                .get_c_partial_write(&self.c_partial_fibers)
        };
        let Some(cache_write) = cache_write else {
            return;
        };
        if cache_write.kind == CacheWriteKind::WriteLast {
            self.c_partial_write_idx = INVALID_IDX;
            self.stats.num_c_partial_rows += 1;
        }
        self.cache_write_port.add_msg_send(cache_write);
    }

    fn fiber_source_ready(&self, src: FiberSource) -> bool {
        debug_assert!(src.valid());
        if src.merge_tree_src() {
            let root_level = &self.merge_trees[src.index as usize].levels[0];
            if root_level.task != src.task_idx {
                return false;
            }
            return root_level.nodes[0].ready_to_merge(self.params.dyn_merger_width);
        }
        self.dyn_nodes[src.index as usize]
            .data
            .ready_to_merge(self.params.dyn_merger_width)
    }

    /// Detach a drained source; for a tree root this retires the root task.
    fn reset_source(&mut self, src: FiberSource) {
        if src.merge_tree_src() {
            let root_level = &mut self.merge_trees[src.index as usize].levels[0];
            root_level.task = INVALID_IDX;
            root_level.num_active_nodes = 0;
        }
    }

    /// Of all nodes ready this cycle, at most `num_final_mergers` perform a
    /// two-source merge; single-source nodes do a bulk transfer that does
    /// not count against the budget.
    fn update_dynamic_nodes(&mut self, mat: &mut MatrixData) {
        let mut possible_merges = Vec::new();
        for i in 0..self.dyn_nodes.len() {
            let node = &self.dyn_nodes[i];
            if node.data.len() > self.params.output_buffer_size - self.params.dyn_merger_width
                || node.output.num_bytes_write
                    > (self.params.output_buffer_size - self.params.dyn_merger_width)
                        * ELEMENT_SIZE
            {
                continue;
            }
            if !node.src1.valid() && !node.src2.valid() {
                continue;
            }
            if node.src1.valid() && !self.fiber_source_ready(node.src1) {
                continue;
            }
            if node.src2.valid() && !self.fiber_source_ready(node.src2) {
                continue;
            }
            possible_merges.push(i);
        }
        let mut num_merges = 0;
        for &i in &possible_merges {
            let src1 = self.dyn_nodes[i].src1;
            let src2 = self.dyn_nodes[i].src2;
            let num_elements_out;
            if src1.valid() && src2.valid() {
                if num_merges == self.params.num_final_mergers {
                    continue;
                }
                let mut buf1 = take_source(&mut self.merge_trees, &mut self.dyn_nodes, src1);
                let mut buf2 = take_source(&mut self.merge_trees, &mut self.dyn_nodes, src2);
                {
                    let dest = match self.dyn_nodes[i].output.c_partial {
                        Some(p) => &mut self.c_partial_fibers[p as usize].data,
                        None => &mut self.dyn_nodes[i].data,
                    };
                    num_elements_out = do_merge_add(
                        dest,
                        &mut buf1,
                        &mut buf2,
                        false,
                        &self.params,
                        &mut self.stats,
                        mat.compute_result,
                    );
                }
                let finished1 = buf1.finished();
                let finished2 = buf2.finished();
                put_source(&mut self.merge_trees, &mut self.dyn_nodes, src1, buf1);
                put_source(&mut self.merge_trees, &mut self.dyn_nodes, src2, buf2);
                if finished1 {
                    self.reset_source(src1);
                    self.dyn_nodes[i].src1 = FiberSource::default();
                }
                if finished2 {
                    self.reset_source(src2);
                    self.dyn_nodes[i].src2 = FiberSource::default();
                }
                num_merges += 1;
            } else {
                let src = if src1.valid() { src1 } else { src2 };
                debug_assert!(src.valid());
                let mut buf = take_source(&mut self.merge_trees, &mut self.dyn_nodes, src);
                {
                    let dest = match self.dyn_nodes[i].output.c_partial {
                        Some(p) => &mut self.c_partial_fibers[p as usize].data,
                        None => &mut self.dyn_nodes[i].data,
                    };
                    num_elements_out =
                        fiber_buffer_transfer(&mut buf, dest, self.params.dyn_merger_width);
                }
                let finished = buf.finished();
                put_source(&mut self.merge_trees, &mut self.dyn_nodes, src, buf);
                if finished {
                    self.reset_source(src);
                    if src1.valid() {
                        self.dyn_nodes[i].src1 = FiberSource::default();
                    } else {
                        self.dyn_nodes[i].src2 = FiberSource::default();
                    }
                }
            }
            if let Some(p) = self.dyn_nodes[i].output.c_partial {
                self.dyn_nodes[i].data.last = self.c_partial_fibers[p as usize].data.last;
            }
            if self.dyn_nodes[i].output.valid() {
                let node = &mut self.dyn_nodes[i];
                write_c_output(
                    &mut node.output,
                    &mut node.data,
                    num_elements_out,
                    mat,
                    &mut self.stats,
                );
            }
        }
    }

    fn update_merge_trees(&mut self, mat: &mut MatrixData) {
        let mut ctx = TreeCtx {
            params: &self.params,
            stats: &mut self.stats,
            pool: &mut self.c_partial_fibers,
            mat,
        };
        for tree in &mut self.merge_trees {
            tree.update(&mut ctx);
        }
    }

    /// Phase two of allocation: place pending subtask work onto trees, then
    /// pair equal-depth sources into free dynamic nodes.
    fn allocate_task(&mut self) {
        if self.task_allocator.empty() {
            return;
        }
        if !self.task_allocator.all_rows_allocated() {
            for i in 0..self.merge_trees.len() {
                if self.add_task_merge_tree(i) {
                    return;
                }
            }
        }
        if self.task_allocator.allocated_sources.len() < 2 {
            return;
        }
        let mut idx_merge = None;
        for i in 1..self.task_allocator.allocated_sources.len() {
            if self.task_allocator.allocated_sources[i - 1].1
                == self.task_allocator.allocated_sources[i].1
            {
                idx_merge = Some(i);
                break;
            }
        }
        let idx_merge = match idx_merge {
            Some(idx) => idx,
            None if self.task_allocator.all_rows_allocated() => {
                self.task_allocator.allocated_sources.len() - 1
            }
            None => return,
        };
        for i in 0..self.dyn_nodes.len() {
            if self.dyn_nodes[i].empty() {
                self.add_task_dyn_node(i, idx_merge);
                return;
            }
        }
    }

    fn task_allocator_single_subtask(&self) -> bool {
        self.task_allocator.allocated_sources.is_empty()
            && self.task_allocator.num_b_rows + self.task_allocator.c_partial_fibers.len()
                <= self.params.merge_tree_size
    }

    /// Load one tree with up to `merge_tree_size` inputs (prefetched B rows
    /// first, pooled partials as filler). A single-subtask row attaches its
    /// sink directly; otherwise the tree root becomes an allocated source.
    fn add_task_merge_tree(&mut self, tree_idx: usize) -> bool {
        if self.task_allocator.trees_allocated[tree_idx] {
            return false;
        }
        let b_rows_to_allocate = self
            .params
            .merge_tree_size
            .min(self.task_allocator.num_b_rows);
        if self.a_values_fetcher.num_elements < b_rows_to_allocate
            || self.prefetched_b_rows.len() < b_rows_to_allocate
        {
            self.stats.a_data_stalls += 1;
            return false;
        }
        if self.merge_trees[tree_idx].num_active_inputs > 0 {
            return false;
        }
        let input_task = self.merge_trees[tree_idx].input_task as usize;
        if self.merge_trees[tree_idx].outputs[input_task].valid() {
            return false;
        }
        if self.task_allocator_single_subtask() {
            if self.task_allocator.output.c_partial.is_some() {
                if self.c_partial_write_idx != INVALID_IDX || self.c_partial_head_fiber.is_some() {
                    self.stats.c_partial_stalls += 1;
                    return false;
                }
                self.c_partial_write_idx = tree_idx as u32;
                self.c_partial_head_fiber = self.task_allocator.output.c_partial;
            }
            self.merge_trees[tree_idx].outputs[input_task] =
                mem::take(&mut self.task_allocator.output);
        } else {
            self.task_allocator.allocated_sources.push((
                FiberSource {
                    index: tree_idx as u32,
                    task_idx: input_task as u32,
                },
                0,
            ));
            self.task_allocator.trees_allocated[tree_idx] = true;
        }
        let tree = &mut self.merge_trees[tree_idx];
        while (tree.num_active_inputs as usize) < b_rows_to_allocate {
            let row = self.prefetched_b_rows.pop_front().expect("prefetch queue");
            tree.inputs[tree.num_active_inputs as usize] = InputFiber {
                a_value: self.a_values_fetcher.front(),
                b_row_ptr: row.b_row_ptr,
                head_ptr: row.row_head_ptr,
                ..Default::default()
            };
            self.a_values_fetcher.pop();
            tree.num_active_inputs += 1;
        }
        self.task_allocator.num_b_rows -= b_rows_to_allocate;
        while (tree.num_active_inputs as usize) < tree.inputs.len()
            && !self.task_allocator.c_partial_fibers.is_empty()
        {
            let fiber = self
                .task_allocator
                .c_partial_fibers
                .pop()
                .expect("partial list");
            tree.inputs[tree.num_active_inputs as usize] = InputFiber {
                c_partial: Some(fiber),
                ..Default::default()
            };
            tree.num_active_inputs += 1;
        }
        true
    }

    /// Pair `allocated_sources[idx_merge - 1]` and `[idx_merge]` into a free
    /// dynamic node; the task's last merge attaches the task sink.
    fn add_task_dyn_node(&mut self, node_idx: usize, idx_merge: usize) {
        let prev_src = self.task_allocator.allocated_sources[idx_merge - 1].0;
        let cur_src = self.task_allocator.allocated_sources[idx_merge].0;
        if self.task_allocator.last_merge() {
            if self.task_allocator.output.c_partial.is_some() {
                if self.c_partial_write_idx != INVALID_IDX || self.c_partial_head_fiber.is_some() {
                    self.stats.c_partial_stalls += 1;
                    return;
                }
                self.c_partial_write_idx = (node_idx + self.merge_trees.len()) as u32;
                self.c_partial_head_fiber = self.task_allocator.output.c_partial;
            }
            self.dyn_nodes[node_idx].src1 = prev_src;
            self.dyn_nodes[node_idx].src2 = cur_src;
            self.dyn_nodes[node_idx].data.last = false;
            self.dyn_nodes[node_idx].output = mem::take(&mut self.task_allocator.output);
            self.task_allocator.reset();
        } else {
            self.dyn_nodes[node_idx].src1 = prev_src;
            self.dyn_nodes[node_idx].src2 = cur_src;
            self.dyn_nodes[node_idx].data.last = false;
            let entry = &mut self.task_allocator.allocated_sources[idx_merge - 1];
            entry.0 = FiberSource {
                index: node_idx as u32,
                task_idx: INVALID_IDX,
            };
            entry.1 += 1;
            self.task_allocator.allocated_sources.remove(idx_merge);
        }
    }

    /// Phase one of allocation: stage the next A row (or the next task-tree
    /// step) into the task allocator.
    fn get_new_task(&mut self, mat: &MatrixData) {
        if !self.task_allocator.empty() {
            return;
        }
        if self.task_tree.empty() {
            if self.a_row_ptr_fetcher.num_elements < 2
                || self.a_row_idx_fetcher.num_elements == 0
                || self.c_row_ptr_fetcher.num_elements == 0
            {
                return;
            }
            let a_row_idx = self.a_row_idx_fetcher.front();
            let c_row_ptr = self.c_row_ptr_fetcher.front();
            let num_rows_merge =
                (self.a_row_ptr_fetcher.at(1) - self.a_row_ptr_fetcher.front()) as usize;
            self.a_row_ptr_fetcher.pop();
            self.a_row_idx_fetcher.pop();
            self.c_row_ptr_fetcher.pop();
            if num_rows_merge <= self.params.max_rows_merge {
                self.task_allocator.output.c_row_idx = a_row_idx;
                self.task_allocator.output.c_row_ptr = c_row_ptr;
                self.task_allocator.output.write_address =
                    mat.c_elements_addr + c_row_ptr as u64 * ELEMENT_SIZE as u64;
                self.task_allocator.num_b_rows = num_rows_merge;
                return;
            }
            self.task_tree
                .init(num_rows_merge, a_row_idx, c_row_ptr, self.params.max_rows_merge);
        }
        debug_assert!(!self.task_tree.empty());
        let max_rows_merge = self.params.max_rows_merge;
        let last_level = self.task_tree.num_c_partials_level.len() - 1;
        if self.task_tree.tree_level == 0 {
            debug_assert!(self.task_tree.b_rows_first_level > 0);
            let Some(c_partial) = self.get_c_partial_fiber() else {
                return;
            };
            let b_rows_merge = self.task_tree.b_rows_first_level.min(max_rows_merge);
            self.task_tree.b_rows_first_level -= b_rows_merge;
            let slot = self.task_tree.num_c_partials_level[0];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            self.task_allocator.output.c_partial = Some(c_partial);
            self.task_allocator.num_b_rows = b_rows_merge;
            self.task_tree.num_c_partials_level[0] += 1;
            if self.task_tree.num_c_partials_level[0] == max_rows_merge
                || self.task_tree.b_rows_first_level == 0
            {
                self.task_tree.tree_level = 1;
            }
            return;
        }
        if self.task_tree.tree_level == 1 {
            if self.task_tree.tree_level == last_level {
                debug_assert!(
                    self.task_tree.b_rows_second_level + self.task_tree.num_c_partials_level[0]
                        == max_rows_merge
                );
                self.task_allocator.output.c_row_idx = self.task_tree.c_row_idx;
                self.task_allocator.output.c_row_ptr = self.task_tree.c_row_ptr;
                self.task_allocator.output.write_address =
                    mat.c_elements_addr + self.task_tree.c_row_ptr as u64 * ELEMENT_SIZE as u64;
                self.task_allocator.num_b_rows = self.task_tree.b_rows_second_level;
                for i in 0..self.task_tree.num_c_partials_level[0] {
                    let fiber = self.task_tree.c_partial_fibers[i]
                        .take()
                        .expect("level-0 partial missing");
                    self.task_allocator.c_partial_fibers.push(fiber);
                }
                self.task_tree.reset();
                return;
            }
            let Some(c_partial) = self.get_c_partial_fiber() else {
                return;
            };
            let b_rows_merge = max_rows_merge - self.task_tree.num_c_partials_level[0];
            let slot = max_rows_merge + self.task_tree.num_c_partials_level[1];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            self.task_allocator.output.c_partial = Some(c_partial);
            self.task_allocator.num_b_rows = b_rows_merge;
            for i in 0..self.task_tree.num_c_partials_level[0] {
                let fiber = self.task_tree.c_partial_fibers[i]
                    .take()
                    .expect("level-0 partial missing");
                self.task_allocator.c_partial_fibers.push(fiber);
            }
            self.task_tree.num_c_partials_level[0] = 0;
            self.task_tree.num_c_partials_level[1] += 1;
            if self.task_tree.num_c_partials_level[1] == max_rows_merge {
                self.task_tree.tree_level += 1;
            } else if self.task_tree.b_rows_first_level > 0 {
                self.task_tree.tree_level = 0;
            }
            return;
        }
        if self.task_tree.tree_level < last_level {
            debug_assert!(
                self.task_tree.num_c_partials_level[self.task_tree.tree_level - 1]
                    == max_rows_merge
            );
            let Some(c_partial) = self.get_c_partial_fiber() else {
                return;
            };
            let level = self.task_tree.tree_level;
            let slot = max_rows_merge * level + self.task_tree.num_c_partials_level[level];
            debug_assert!(self.task_tree.c_partial_fibers[slot].is_none());
            self.task_tree.c_partial_fibers[slot] = Some(c_partial);
            self.task_allocator.output.c_partial = Some(c_partial);
            for i in 0..max_rows_merge {
                let fiber = self.task_tree.c_partial_fibers[(level - 1) * max_rows_merge + i]
                    .take()
                    .expect("lower-level partial missing");
                self.task_allocator.c_partial_fibers.push(fiber);
            }
            self.task_tree.num_c_partials_level[level - 1] = 0;
            self.task_tree.num_c_partials_level[level] += 1;
            if self.task_tree.num_c_partials_level[level] == max_rows_merge {
                self.task_tree.tree_level += 1;
            } else if self.task_tree.b_rows_first_level > 0 {
                self.task_tree.tree_level = 0;
            } else {
                self.task_tree.tree_level = 1;
            }
            return;
        }
        // last level
        debug_assert!(
            self.task_tree.num_c_partials_level[self.task_tree.tree_level - 1] == max_rows_merge
        );
        self.task_allocator.output.c_row_idx = self.task_tree.c_row_idx;
        self.task_allocator.output.c_row_ptr = self.task_tree.c_row_ptr;
        self.task_allocator.output.write_address =
            mat.c_elements_addr + self.task_tree.c_row_ptr as u64 * ELEMENT_SIZE as u64;
        let level = self.task_tree.tree_level;
        for i in 0..max_rows_merge {
            let fiber = self.task_tree.c_partial_fibers[(level - 1) * max_rows_merge + i]
                .take()
                .expect("lower-level partial missing");
            self.task_allocator.c_partial_fibers.push(fiber);
        }
        self.task_tree.reset();
    }

    /// Claim the first idle pool slot and reopen its stream.
    fn get_c_partial_fiber(&mut self) -> Option<u32> {
        for (i, fiber) in self.c_partial_fibers.iter_mut().enumerate() {
            if fiber.finished() {
                fiber.data.last = false;
                return Some(i as u32);
            }
        }
        None
    }

    fn receive_a_data(&mut self) {
        let Some(response) = self.mem_read_port.take_msg_received() else {
            return;
        };
        debug_assert!(response.id < 4);
        match response.id {
            0 => self.a_row_ptr_fetcher.receive_data(response.address),
            1 => self.a_row_idx_fetcher.receive_data(response.address),
            2 => self.c_row_ptr_fetcher.receive_data(response.address),
            _ => self.a_values_fetcher.receive_data(response.address),
        };
    }

    fn receive_prefetch_data(&mut self) {
        let Some(rows) = self.prefetch_port.peek_msg_received() else {
            return;
        };
        if self.prefetched_b_rows.len() + rows.len() <= self.params.max_prefetched_rows {
            self.prefetched_b_rows.extend(rows);
            self.prefetch_port.take_msg_received();
        }
    }

    fn receive_cache_data(&mut self) {
        for i in 0..self.cache_read_ports.len() {
            if let Some(response) = self.cache_read_ports[i].take_msg_received() {
                self.merge_trees[i].receive_response(
                    &response,
                    &self.params,
                    &mut self.c_partial_fibers,
                );
            }
        }
        if let Some(head_ptr) = self.cache_write_port.take_msg_received() {
            let fiber = self
                .c_partial_head_fiber
                .take()
                .expect("head pointer response without writer");
            debug_assert!(self.c_partial_fibers[fiber as usize].head_ptr == INVALID_IDX);
            self.c_partial_fibers[fiber as usize].head_ptr = head_ptr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_tree_split_conserves_rows() {
        let mut tree = TaskTree::default();
        tree.init(20, 0, 0, 8);
        assert_eq!(tree.num_c_partials_level.len(), 2);
        assert_eq!(tree.b_rows_first_level + tree.b_rows_second_level, 20);
        // pivot is the largest power of 8 at most 20
        assert_eq!(tree.b_rows_first_level, div_ceil((20 - 8) * 8, 7) as usize);

        tree.reset();
        tree.init(64, 0, 0, 8);
        assert_eq!(tree.b_rows_first_level, 64);
        assert_eq!(tree.b_rows_second_level, 0);
        assert_eq!(tree.num_c_partials_level.len(), 2);
    }

    #[test]
    fn fiber_source_kinds() {
        let tree_src = FiberSource {
            index: 1,
            task_idx: 0,
        };
        assert!(tree_src.valid() && tree_src.merge_tree_src());
        let dyn_src = FiberSource {
            index: 0,
            task_idx: INVALID_IDX,
        };
        assert!(dyn_src.valid() && !dyn_src.merge_tree_src());
        assert!(!FiberSource::default().valid());
    }
}
