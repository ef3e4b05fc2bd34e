use std::collections::VecDeque;
use std::mem;

use crate::base::math::inc_mod;
use crate::base::{Addr, BLOCK_SIZE, BLOCK_SIZE_BYTES, ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX, MEM_TRANSACTION_SIZE};
use crate::forest::{CacheRead, CacheResponse, CacheWrite, CacheWriteKind, ForestParams, ForestStats};
use crate::matrix::data::MatrixData;

/// Streaming fiber FIFO. `last` marks end-of-stream; a buffer is finished
/// once it is both drained and closed.
#[derive(Debug, Clone)]
pub struct FiberBuffer {
    pub col_idx: VecDeque<u32>,
    pub values: VecDeque<f64>,
    pub last: bool,
}

impl Default for FiberBuffer {
    fn default() -> Self {
        FiberBuffer {
            col_idx: VecDeque::new(),
            values: VecDeque::new(),
            last: true,
        }
    }
}

impl FiberBuffer {
    pub fn empty(&self) -> bool {
        self.col_idx.is_empty()
    }

    pub fn finished(&self) -> bool {
        self.col_idx.is_empty() && self.last
    }

    pub fn len(&self) -> usize {
        self.col_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    /// A source may be merged once it can feed a full merger width or has
    /// reached end-of-stream.
    pub fn ready_to_merge(&self, width: usize) -> bool {
        self.last || self.col_idx.len() >= width
    }
}

/// Pool slot for an intermediate result streamed through the linked-list
/// cache. `head_ptr` is the cache block assigned to the row head once the
/// first spill block lands.
#[derive(Debug, Clone)]
pub struct CPartialFiber {
    pub data: FiberBuffer,
    pub head_ptr: u32,
}

impl Default for CPartialFiber {
    fn default() -> Self {
        CPartialFiber {
            data: FiberBuffer::default(),
            head_ptr: INVALID_IDX,
        }
    }
}

impl CPartialFiber {
    pub fn finished(&self) -> bool {
        self.data.finished()
    }
}

/// Sink of a task: a final C row (with its write address) or a pool slot.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub c_partial: Option<u32>,
    pub c_row_idx: u32,
    pub c_row_ptr: u32,
    pub num_bytes_write: usize,
    pub write_address: Addr,
}

impl Default for TaskOutput {
    fn default() -> Self {
        TaskOutput {
            c_partial: None,
            c_row_idx: INVALID_IDX,
            c_row_ptr: INVALID_IDX,
            num_bytes_write: 0,
            write_address: INVALID_ADDR,
        }
    }
}

impl TaskOutput {
    pub fn valid(&self) -> bool {
        self.c_partial.is_some() || self.write_address != INVALID_ADDR
    }

    /// Next transaction-aligned memory write for a final row, if enough
    /// bytes have accumulated. Partial trailing transactions only flush
    /// once the row's extent is known.
    pub fn get_c_write_address(&mut self) -> Addr {
        if self.write_address == INVALID_ADDR || self.num_bytes_write == 0 {
            return INVALID_ADDR;
        }
        let ret_address = self.write_address;
        let write_size =
            MEM_TRANSACTION_SIZE - (self.write_address % MEM_TRANSACTION_SIZE as u64) as usize;
        if self.num_bytes_write >= write_size {
            self.num_bytes_write -= write_size;
            if self.num_bytes_write == 0 && self.c_row_idx == INVALID_IDX {
                self.write_address = INVALID_ADDR;
                return ret_address;
            }
            self.write_address += write_size as u64;
            return ret_address;
        }
        if self.c_row_idx != INVALID_IDX {
            return INVALID_ADDR;
        }
        self.num_bytes_write = 0;
        self.write_address = INVALID_ADDR;
        ret_address
    }

    /// Next block-sized cache write for a spilled partial row.
    pub fn get_c_partial_write(&mut self, pool: &[CPartialFiber]) -> Option<CacheWrite> {
        let p = self.c_partial?;
        if self.num_bytes_write >= BLOCK_SIZE_BYTES {
            self.num_bytes_write -= BLOCK_SIZE_BYTES;
            if self.num_bytes_write == 0 && pool[p as usize].data.last {
                self.c_partial = None;
                return Some(CacheWrite {
                    kind: CacheWriteKind::WriteLast,
                    num_elements: BLOCK_SIZE as u32,
                });
            }
            return Some(CacheWrite {
                kind: CacheWriteKind::Write,
                num_elements: BLOCK_SIZE as u32,
            });
        }
        if self.num_bytes_write == 0 || !pool[p as usize].data.last {
            return None;
        }
        let cache_write = CacheWrite {
            kind: CacheWriteKind::WriteLast,
            num_elements: (self.num_bytes_write / ELEMENT_SIZE) as u32,
        };
        self.num_bytes_write = 0;
        self.c_partial = None;
        Some(cache_write)
    }
}

/// Input to one merge tree: a B row slice with its A scalar, or a partial
/// fiber being re-read from the cache.
#[derive(Debug, Clone)]
pub struct InputFiber {
    pub c_partial: Option<u32>,
    pub a_value: f64,
    pub b_row_ptr: u32,
    pub head_ptr: u32,
    pub request_sent: bool,
    pub b_num_elements: u32,
    pub next_data: FiberBuffer,
}

impl Default for InputFiber {
    fn default() -> Self {
        InputFiber {
            c_partial: None,
            a_value: 0.0,
            b_row_ptr: u32::MAX,
            head_ptr: INVALID_IDX,
            request_sent: false,
            b_num_elements: 0,
            next_data: FiberBuffer::default(),
        }
    }
}

impl InputFiber {
    pub fn finished(&self) -> bool {
        self.c_partial.is_none() && self.head_ptr == INVALID_IDX && self.b_num_elements == 0
    }
}

#[derive(Debug, Default)]
pub struct TreeLevel {
    pub nodes: Vec<FiberBuffer>,
    pub task: u32,
    pub num_active_nodes: u32,
}

impl TreeLevel {
    fn init(&mut self, new_task: u32, num_nodes: u32) {
        self.task = new_task;
        self.num_active_nodes = num_nodes;
        for node in self.nodes.iter_mut().take(num_nodes as usize) {
            debug_assert!(node.finished());
            node.last = false;
        }
    }
}

/// Everything a merge tree needs from its manager for one cycle.
pub struct TreeCtx<'a> {
    pub params: &'a ForestParams,
    pub stats: &'a mut ForestStats,
    pub pool: &'a mut [CPartialFiber],
    pub mat: &'a mut MatrixData,
}

/// Complete binary merge tree. Level 0 is the root; the base level holds
/// one fiber buffer per input. Tasks rotate through `outputs` so the next
/// task can start loading while the previous one drains.
pub struct MergeTree {
    pub inputs: Vec<InputFiber>,
    pub num_active_inputs: u32,
    pub input_task: u32,
    input_arbiter: usize,
    mult_arbiter: usize,
    pub levels: Vec<TreeLevel>,
    pub outputs: Vec<TaskOutput>,
}

impl MergeTree {
    pub fn new(merge_tree_size: usize) -> Self {
        let num_levels = crate::base::math::log2_ceil(merge_tree_size as u64) as usize + 1;
        let mut levels = Vec::with_capacity(num_levels);
        let mut size = 1;
        for _ in 0..num_levels {
            levels.push(TreeLevel {
                nodes: vec![FiberBuffer::default(); size],
                task: INVALID_IDX,
                num_active_nodes: 0,
            });
            size *= 2;
        }
        MergeTree {
            inputs: vec![InputFiber::default(); merge_tree_size],
            num_active_inputs: 0,
            input_task: 0,
            input_arbiter: usize::MAX,
            mult_arbiter: usize::MAX,
            outputs: vec![TaskOutput::default(); num_levels],
            levels,
        }
    }

    pub fn reset(&mut self) {
        self.inputs.fill(InputFiber::default());
        self.num_active_inputs = 0;
        self.input_task = 0;
        self.input_arbiter = usize::MAX;
        self.mult_arbiter = usize::MAX;
        for level in &mut self.levels {
            level.nodes.fill(FiberBuffer::default());
            level.task = INVALID_IDX;
            level.num_active_nodes = 0;
        }
        self.outputs.fill(TaskOutput::default());
    }

    pub fn inactive(&self) -> bool {
        self.num_active_inputs == 0 && self.levels[0].task == INVALID_IDX
    }

    /// Occupancy charged against one input's buffer budget: its base node
    /// plus staged and not-yet-multiplied elements.
    fn input_buffer_size(&self, idx: usize) -> usize {
        self.levels.last().expect("levels never empty").nodes[idx].len()
            + self.inputs[idx].b_num_elements as usize
            + self.inputs[idx].next_data.len()
    }

    /// Round-robin over inputs for the next row-cache read.
    pub fn get_request(&mut self, params: &ForestParams, pool: &[CPartialFiber]) -> CacheRead {
        for _ in 0..self.inputs.len() {
            self.input_arbiter = inc_mod(self.input_arbiter, self.inputs.len());
            let i = self.input_arbiter;
            if self.inputs[i].request_sent {
                continue;
            }
            if let Some(p) = self.inputs[i].c_partial {
                let fiber = &pool[p as usize];
                if self.inputs[i].head_ptr == INVALID_IDX
                    && !fiber.finished()
                    && fiber.head_ptr != INVALID_IDX
                {
                    self.inputs[i].head_ptr = fiber.head_ptr;
                }
            }
            if self.inputs[i].head_ptr != INVALID_IDX
                && self.input_buffer_size(i) + BLOCK_SIZE <= params.input_buffer_size
            {
                self.inputs[i].request_sent = true;
                return CacheRead {
                    row_ptr: self.inputs[i].head_ptr,
                    id: i as u32,
                };
            }
        }
        CacheRead::default()
    }

    pub fn receive_response(
        &mut self,
        resp: &CacheResponse,
        params: &ForestParams,
        pool: &mut [CPartialFiber],
    ) {
        let id = resp.id as usize;
        debug_assert!(id < self.inputs.len());
        debug_assert!(
            self.inputs[id].request_sent
                && self.input_buffer_size(id) + resp.num_elements as usize
                    <= params.input_buffer_size
        );
        let base_task = self.levels.last().expect("levels never empty").task;
        match self.inputs[id].c_partial {
            Some(p) => {
                debug_assert!(pool[p as usize].data.len() >= resp.num_elements as usize);
                let base_idx = self.levels.len() - 1;
                {
                    let buffer = if self.input_task == base_task {
                        &mut self.levels[base_idx].nodes[id]
                    } else {
                        &mut self.inputs[id].next_data
                    };
                    buffer.last = false;
                    fiber_buffer_transfer(
                        &mut pool[p as usize].data,
                        buffer,
                        resp.num_elements as usize,
                    );
                }
                if pool[p as usize].finished() {
                    debug_assert!(resp.row_ptr == INVALID_IDX);
                    pool[p as usize].head_ptr = INVALID_IDX;
                    self.inputs[id].c_partial = None;
                }
            }
            None => {
                self.inputs[id].b_num_elements += resp.num_elements;
            }
        }
        self.inputs[id].head_ptr = resp.row_ptr;
        self.inputs[id].request_sent = false;
        // an input staged into next_data stays active until the swap into
        // the base level delivers its data
        if self.inputs[id].finished()
            && (self.input_task == base_task || self.inputs[id].next_data.finished())
        {
            debug_assert!(self.num_active_inputs > 0);
            self.num_active_inputs -= 1;
            if self.num_active_inputs == 0 {
                self.input_task = inc_mod(self.input_task as usize, self.levels.len()) as u32;
            }
        }
    }

    /// Memory write stream for the task currently at the root.
    pub fn get_c_write_address(&mut self) -> Addr {
        let task = self.levels[0].task;
        if task == INVALID_IDX {
            return INVALID_ADDR;
        }
        let output = &mut self.outputs[task as usize];
        if !output.valid() {
            return INVALID_ADDR;
        }
        let address = output.get_c_write_address();
        if !output.valid() {
            self.levels[0].task = INVALID_IDX;
        }
        address
    }

    /// Cache write stream for the task currently at the root.
    pub fn get_c_partial_write(&mut self, pool: &[CPartialFiber]) -> Option<CacheWrite> {
        let task = self.levels[0].task;
        if task == INVALID_IDX {
            return None;
        }
        let output = &mut self.outputs[task as usize];
        if !output.valid() {
            return None;
        }
        let cache_write = output.get_c_partial_write(pool);
        if !output.valid() {
            self.levels[0].task = INVALID_IDX;
        }
        cache_write
    }

    pub fn update(&mut self, ctx: &mut TreeCtx) {
        for i in 0..self.levels.len() - 1 {
            self.update_level(i, ctx);
        }
        self.update_base(ctx);
    }

    /// One merge per level per cycle, parent pair into child node.
    fn update_level(&mut self, idx: usize, ctx: &mut TreeCtx) {
        debug_assert!(idx < self.levels.len() - 1);
        if self.levels[idx].task == INVALID_IDX {
            if self.levels[idx + 1].task == INVALID_IDX {
                return;
            }
            let num_nodes = (self.levels[idx + 1].num_active_nodes + 1) / 2;
            let next_task = self.levels[idx + 1].task;
            self.levels[idx].init(next_task, num_nodes);
        }
        if self.levels[idx].task != self.levels[idx + 1].task {
            return;
        }
        if idx == 0 {
            self.update_root(ctx);
            return;
        }
        let width = ctx.params.merge_tree_merger_width;
        let (cur_slice, next_slice) = self.levels.split_at_mut(idx + 1);
        let cur_level = &mut cur_slice[idx];
        let next_level = &mut next_slice[0];
        for i in 0..cur_level.nodes.len() {
            let dest = &mut cur_level.nodes[i];
            if dest.len() > width {
                continue;
            }
            let (left, right) = next_level.nodes.split_at_mut(2 * i + 1);
            let src1 = &mut left[2 * i];
            let src2 = &mut right[0];
            if src1.finished() && src2.finished() {
                continue;
            }
            if !src1.ready_to_merge(width) || !src2.ready_to_merge(width) {
                continue;
            }
            if src1.finished() {
                fiber_buffer_transfer(src2, dest, width);
                if src2.finished() {
                    debug_assert!(next_level.num_active_nodes > 0);
                    next_level.num_active_nodes -= 1;
                }
            } else if src2.finished() {
                fiber_buffer_transfer(src1, dest, width);
                if src1.finished() {
                    debug_assert!(next_level.num_active_nodes > 0);
                    next_level.num_active_nodes -= 1;
                }
            } else {
                do_merge_add(
                    dest,
                    src1,
                    src2,
                    true,
                    ctx.params,
                    ctx.stats,
                    ctx.mat.compute_result,
                );
                if src1.finished() {
                    debug_assert!(next_level.num_active_nodes > 0);
                    next_level.num_active_nodes -= 1;
                }
                if src2.finished() {
                    debug_assert!(next_level.num_active_nodes > 0);
                    next_level.num_active_nodes -= 1;
                }
            }
            if next_level.num_active_nodes == 0 {
                next_level.task = INVALID_IDX;
            }
            break;
        }
    }

    /// The root merge is gated by the output buffer and writes either into
    /// the root node (final rows) or straight into the attached partial.
    fn update_root(&mut self, ctx: &mut TreeCtx) {
        debug_assert!(self.levels[0].task != INVALID_IDX);
        debug_assert!(self.levels[0].task == self.levels[1].task);
        let task = self.levels[0].task as usize;
        let width = ctx.params.merge_tree_merger_width;
        if self.outputs[task].num_bytes_write
            > (ctx.params.output_buffer_size - width) * ELEMENT_SIZE
        {
            return;
        }
        let (root_slice, rest) = self.levels.split_at_mut(1);
        let dest = &mut root_slice[0].nodes[0];
        let l1 = &mut rest[0];
        let (left, right) = l1.nodes.split_at_mut(1);
        let src1 = &mut left[0];
        let src2 = &mut right[0];
        debug_assert!(!src1.finished() || !src2.finished());
        if dest.len() > width.max(ctx.params.dyn_merger_width)
            || !src1.ready_to_merge(width)
            || !src2.ready_to_merge(width)
        {
            return;
        }
        let output = &mut self.outputs[task];
        let num_elements_out;
        {
            let buffer = match output.c_partial {
                Some(p) => &mut ctx.pool[p as usize].data,
                None => &mut *dest,
            };
            if src1.finished() {
                num_elements_out = fiber_buffer_transfer(src2, buffer, width);
                if src2.finished() {
                    debug_assert!(l1.num_active_nodes > 0);
                    l1.num_active_nodes -= 1;
                }
            } else if src2.finished() {
                num_elements_out = fiber_buffer_transfer(src1, buffer, width);
                if src1.finished() {
                    debug_assert!(l1.num_active_nodes > 0);
                    l1.num_active_nodes -= 1;
                }
            } else {
                num_elements_out = do_merge_add(
                    buffer,
                    src1,
                    src2,
                    true,
                    ctx.params,
                    ctx.stats,
                    ctx.mat.compute_result,
                );
                if src1.finished() {
                    debug_assert!(l1.num_active_nodes > 0);
                    l1.num_active_nodes -= 1;
                }
                if src2.finished() {
                    debug_assert!(l1.num_active_nodes > 0);
                    l1.num_active_nodes -= 1;
                }
            }
        }
        if l1.num_active_nodes == 0 {
            l1.task = INVALID_IDX;
        }
        if let Some(p) = output.c_partial {
            dest.last = ctx.pool[p as usize].data.last;
        }
        if output.valid() {
            write_c_output(output, dest, num_elements_out, ctx.mat, ctx.stats);
        }
    }

    /// Fill the base level: roll staged data in when a new task starts, and
    /// feed one block multiply from an eligible input per cycle.
    fn update_base(&mut self, ctx: &mut TreeCtx) {
        let base_idx = self.levels.len() - 1;
        if self.levels[base_idx].task == INVALID_IDX {
            if self.num_active_inputs == 0 {
                return;
            }
            self.levels[base_idx].task = self.input_task;
            self.levels[base_idx].num_active_nodes = self.num_active_inputs;
            for i in 0..self.levels[base_idx].num_active_nodes as usize {
                debug_assert!(self.levels[base_idx].nodes[i].finished());
                if self.inputs[i].next_data.finished() {
                    self.levels[base_idx].nodes[i].last = false;
                } else {
                    mem::swap(
                        &mut self.levels[base_idx].nodes[i],
                        &mut self.inputs[i].next_data,
                    );
                    if self.inputs[i].finished() {
                        debug_assert!(self.num_active_inputs > 0);
                        self.num_active_inputs -= 1;
                        if self.num_active_inputs == 0 {
                            self.input_task =
                                inc_mod(self.input_task as usize, self.levels.len()) as u32;
                        }
                    }
                }
            }
        }
        // one block multiply per cycle, round-robin over inputs with data
        for _ in 0..self.inputs.len() {
            self.mult_arbiter = inc_mod(self.mult_arbiter, self.inputs.len());
            let i = self.mult_arbiter;
            if self.inputs[i].b_num_elements == 0 {
                continue;
            }
            let n = (ctx.params.merge_tree_merger_width as u32).min(self.inputs[i].b_num_elements);
            let a_value = self.inputs[i].a_value;
            let row_ptr = self.inputs[i].b_row_ptr as usize;
            self.inputs[i].b_num_elements -= n;
            self.inputs[i].b_row_ptr += n;
            ctx.stats.num_mults += n as usize;
            ctx.stats.num_block_mults += 1;
            let to_base = self.levels[base_idx].task == self.input_task;
            {
                let buffer = if to_base {
                    &mut self.levels[base_idx].nodes[i]
                } else {
                    &mut self.inputs[i].next_data
                };
                debug_assert!(buffer.len() <= ctx.params.input_buffer_size);
                for k in 0..n as usize {
                    buffer.col_idx.push_back(ctx.mat.b.col_idx[row_ptr + k]);
                    if ctx.mat.compute_result {
                        buffer.values.push_back(a_value * ctx.mat.b.values[row_ptr + k]);
                    }
                }
                if !to_base {
                    buffer.last = false;
                }
            }
            if self.inputs[i].finished() {
                let buffer = if to_base {
                    &mut self.levels[base_idx].nodes[i]
                } else {
                    &mut self.inputs[i].next_data
                };
                buffer.last = true;
                if self.inputs[i].next_data.finished() {
                    debug_assert!(self.num_active_inputs > 0);
                    self.num_active_inputs -= 1;
                    if self.num_active_inputs == 0 {
                        self.input_task =
                            inc_mod(self.input_task as usize, self.levels.len()) as u32;
                    }
                }
            }
            break;
        }
    }
}

/// Merge up to one merger width of elements from two sorted sources,
/// combining equal keys with one addition each.
pub fn do_merge_add(
    dest: &mut FiberBuffer,
    src1: &mut FiberBuffer,
    src2: &mut FiberBuffer,
    is_merge_tree: bool,
    params: &ForestParams,
    stats: &mut ForestStats,
    compute_result: bool,
) -> usize {
    debug_assert!(!src1.empty() && !src2.empty());
    let (merge_width, max_num_adds) = if is_merge_tree {
        (
            params.merge_tree_merger_width,
            params.merge_tree_merger_num_adds,
        )
    } else {
        (params.dyn_merger_width, params.dyn_merger_num_adds)
    };
    let mut num_elements_output = 0;
    let mut num_adds = 0;
    while num_elements_output < merge_width && num_adds < max_num_adds {
        if src1.empty() {
            num_elements_output +=
                fiber_buffer_transfer(src2, dest, merge_width - num_elements_output);
            break;
        }
        if src2.empty() {
            num_elements_output +=
                fiber_buffer_transfer(src1, dest, merge_width - num_elements_output);
            break;
        }
        let head1 = *src1.col_idx.front().expect("source empty");
        let head2 = *src2.col_idx.front().expect("source empty");
        match head1.cmp(&head2) {
            std::cmp::Ordering::Less => {
                dest.col_idx.push_back(src1.col_idx.pop_front().expect("source empty"));
                if compute_result {
                    dest.values.push_back(src1.values.pop_front().expect("source empty"));
                }
            }
            std::cmp::Ordering::Greater => {
                dest.col_idx.push_back(src2.col_idx.pop_front().expect("source empty"));
                if compute_result {
                    dest.values.push_back(src2.values.pop_front().expect("source empty"));
                }
            }
            std::cmp::Ordering::Equal => {
                dest.col_idx.push_back(src1.col_idx.pop_front().expect("source empty"));
                src2.col_idx.pop_front();
                if compute_result {
                    let add_value = src1.values.pop_front().expect("source empty")
                        + src2.values.pop_front().expect("source empty");
                    dest.values.push_back(add_value);
                }
                num_adds += 1;
            }
        }
        num_elements_output += 1;
    }
    if src1.finished() && src2.finished() {
        dest.last = true;
    }
    if is_merge_tree {
        stats.merge_tree_num_merges += 1;
        stats.merge_tree_num_adds += num_adds;
    } else {
        stats.dyn_num_merges += 1;
        stats.dyn_num_adds += num_adds;
    }
    num_elements_output
}

/// Move up to `num_elements` from `src` to `dest`, carrying `last` when the
/// source closes.
pub fn fiber_buffer_transfer(
    src: &mut FiberBuffer,
    dest: &mut FiberBuffer,
    num_elements: usize,
) -> usize {
    let n = num_elements.min(src.len());
    if n == 0 {
        return 0;
    }
    for _ in 0..n {
        dest.col_idx
            .push_back(src.col_idx.pop_front().expect("source empty"));
    }
    if !src.values.is_empty() {
        for _ in 0..n {
            dest.values
                .push_back(src.values.pop_front().expect("source empty"));
        }
    }
    if src.finished() {
        dest.last = true;
    }
    n
}

/// Drain a finished merge step into the result matrix.
pub fn write_c_output(
    output: &mut TaskOutput,
    node: &mut FiberBuffer,
    num_elements_out: usize,
    mat: &mut MatrixData,
    stats: &mut ForestStats,
) {
    output.num_bytes_write += num_elements_out * ELEMENT_SIZE;
    stats.max_write_bytes = stats.max_write_bytes.max(output.num_bytes_write);
    if output.write_address == INVALID_ADDR {
        return;
    }
    debug_assert!(node.len() == num_elements_out);
    while !node.empty() {
        if mat.compute_result {
            mat.c.col_idx[output.c_row_ptr as usize] =
                *node.col_idx.front().expect("node empty");
            mat.c.values[output.c_row_ptr as usize] =
                node.values.pop_front().expect("node empty");
        }
        node.col_idx.pop_front();
        output.c_row_ptr += 1;
        mat.c.nnz += 1;
    }
    if node.finished() {
        mat.c.row_end[output.c_row_idx as usize] = output.c_row_ptr;
        output.c_row_idx = INVALID_IDX;
        output.c_row_ptr = INVALID_IDX;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;

    fn buffer(cols: &[u32], vals: &[f64], last: bool) -> FiberBuffer {
        FiberBuffer {
            col_idx: cols.iter().copied().collect(),
            values: vals.iter().copied().collect(),
            last,
        }
    }

    fn params() -> ForestParams {
        ForestParams {
            max_prefetched_rows: 16,
            merge_tree_size: 4,
            max_rows_merge: 8,
            merge_tree_merger_width: 4,
            merge_tree_merger_num_adds: 3,
            num_final_mergers: 1,
            dyn_merger_width: 4,
            dyn_merger_num_adds: 3,
            input_buffer_size: 16,
            output_buffer_size: 8,
        }
    }

    #[test]
    fn merge_add_combines_equal_keys() {
        let p = params();
        let mut stats = ForestStats::default();
        let mut dest = FiberBuffer::default();
        let mut src1 = buffer(&[0, 2, 4], &[1.0, 2.0, 3.0], true);
        let mut src2 = buffer(&[2, 5], &[10.0, 20.0], true);
        let n = do_merge_add(&mut dest, &mut src1, &mut src2, true, &p, &mut stats, true);
        assert_eq!(n, 4);
        assert_eq!(dest.col_idx, [0, 2, 4, 5]);
        assert_eq!(dest.values, [1.0, 12.0, 3.0, 20.0]);
        assert!(dest.last);
        assert_eq!(stats.merge_tree_num_adds, 1);
        assert_eq!(stats.merge_tree_num_merges, 1);
    }

    #[test]
    fn merge_add_respects_width_and_leftovers() {
        let p = params();
        let mut stats = ForestStats::default();
        let mut dest = FiberBuffer::default();
        let mut src1 = buffer(&[0, 1, 2, 3, 4], &[1.0; 5], true);
        let mut src2 = buffer(&[10, 11], &[1.0; 2], true);
        let n = do_merge_add(&mut dest, &mut src1, &mut src2, true, &p, &mut stats, true);
        assert_eq!(n, 4);
        assert_eq!(dest.col_idx, [0, 1, 2, 3]);
        assert!(!dest.last);
        assert_eq!(src1.len(), 1);
        assert_eq!(src2.len(), 2);
    }

    #[test]
    fn merge_add_stops_at_adder_budget() {
        let mut p = params();
        p.merge_tree_merger_num_adds = 1;
        let mut stats = ForestStats::default();
        let mut dest = FiberBuffer::default();
        let mut src1 = buffer(&[0, 1], &[1.0, 1.0], true);
        let mut src2 = buffer(&[0, 1], &[1.0, 1.0], true);
        let n = do_merge_add(&mut dest, &mut src1, &mut src2, true, &p, &mut stats, true);
        // one add allowed: output stops after the first combined element
        assert_eq!(n, 1);
        assert_eq!(dest.col_idx, [0]);
        assert!(!dest.last);
    }

    #[test]
    fn transfer_moves_tail_and_last() {
        let mut src = buffer(&[1, 2], &[1.0, 2.0], true);
        let mut dest = FiberBuffer {
            last: false,
            ..Default::default()
        };
        assert_eq!(fiber_buffer_transfer(&mut src, &mut dest, 8), 2);
        assert!(dest.last);
        assert!(src.finished());
        assert_eq!(fiber_buffer_transfer(&mut src, &mut dest, 8), 0);
    }

    #[test]
    fn tree_levels_are_powers_of_two() {
        let tree = MergeTree::new(4);
        assert_eq!(tree.levels.len(), 3);
        assert_eq!(tree.levels[0].nodes.len(), 1);
        assert_eq!(tree.levels[1].nodes.len(), 2);
        assert_eq!(tree.levels[2].nodes.len(), 4);
        assert_eq!(tree.outputs.len(), 3);
        assert!(tree.inactive());
    }

    #[test]
    fn task_output_write_address_stream() {
        let mut output = TaskOutput {
            write_address: 96,
            c_row_idx: 3,
            c_row_ptr: 8,
            num_bytes_write: 40,
            c_partial: None,
        };
        // full transaction available
        assert_eq!(output.get_c_write_address(), 96);
        assert_eq!(output.num_bytes_write, 8);
        // trailing 8 bytes wait while the row is still open
        assert_eq!(output.get_c_write_address(), INVALID_ADDR);
        output.c_row_idx = INVALID_IDX;
        assert_eq!(output.get_c_write_address(), 128);
        assert_eq!(output.num_bytes_write, 0);
        assert!(!output.valid());
    }

    #[test]
    fn task_output_partial_write_stream() {
        let pool = vec![
            CPartialFiber {
                data: FiberBuffer {
                    last: false,
                    ..Default::default()
                },
                head_ptr: INVALID_IDX,
            };
            1
        ];
        let mut output = TaskOutput {
            c_partial: Some(0),
            num_bytes_write: BLOCK_SIZE_BYTES + 2 * ELEMENT_SIZE,
            ..Default::default()
        };
        let w = output.get_c_partial_write(&pool).expect("full block ready");
        assert_eq!(w.kind, CacheWriteKind::Write);
        assert_eq!(w.num_elements, BLOCK_SIZE as u32);
        // tail waits for the stream to close
        assert!(output.get_c_partial_write(&pool).is_none());
        let mut pool = pool;
        pool[0].data.last = true;
        let w = output.get_c_partial_write(&pool).expect("tail ready");
        assert_eq!(w.kind, CacheWriteKind::WriteLast);
        assert_eq!(w.num_elements, 2);
        assert!(output.c_partial.is_none());
    }
}
