use std::collections::VecDeque;

use crate::base::math::{inc_mod, round_down_multiple, round_up_multiple};
use crate::base::{Addr, BLOCK_SIZE, BLOCK_SIZE_BYTES, ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX};
use crate::matrix::data::MatrixData;
use crate::sim::mem::{MemRequest, MemResponse};

/// Intermediate merge result spilled through the fiber cache. `begin`/`end`
/// track the byte extent in the C-partials region; the element queues stage
/// data between the producing and the consuming PE.
#[derive(Debug, Default, Clone)]
pub struct CPartialFiber {
    pub col_idx: VecDeque<u32>,
    pub values: VecDeque<f64>,
    pub begin: Addr,
    pub end: Addr,
    pub finished: bool,
}

impl CPartialFiber {
    pub fn empty(&self) -> bool {
        self.begin == INVALID_ADDR
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.col_idx.is_empty()
    }

    fn clear(&mut self) {
        self.col_idx.clear();
        self.values.clear();
        self.begin = INVALID_ADDR;
        self.end = INVALID_ADDR;
        self.finished = false;
    }
}

/// Fixed-size arena of partial fibers. Each slot owns an equal share of the
/// C-partials address region, so a slot index determines its spill window.
pub struct PartialPool {
    fibers: Vec<CPartialFiber>,
    pub num_fibers: usize,
    base_addr: Addr,
}

impl PartialPool {
    pub fn new(size: usize) -> Self {
        PartialPool {
            fibers: vec![
                CPartialFiber {
                    begin: INVALID_ADDR,
                    end: INVALID_ADDR,
                    ..Default::default()
                };
                size
            ],
            num_fibers: 0,
            base_addr: INVALID_ADDR,
        }
    }

    pub fn reset(&mut self, base_addr: Addr) {
        for fiber in &mut self.fibers {
            fiber.clear();
        }
        self.num_fibers = 0;
        self.base_addr = base_addr;
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_full(&self) -> bool {
        self.num_fibers == self.fibers.len()
    }

    pub fn get(&self, idx: u32) -> &CPartialFiber {
        &self.fibers[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut CPartialFiber {
        &mut self.fibers[idx as usize]
    }

    /// Claim a free slot and point it at its share of the spill region.
    pub fn alloc(&mut self) -> Option<u32> {
        let slot_size = round_up_multiple(
            (u64::MAX - self.base_addr) / self.fibers.len() as u64,
            BLOCK_SIZE_BYTES as u64,
        );
        for (i, fiber) in self.fibers.iter_mut().enumerate() {
            if fiber.empty() {
                fiber.begin = self.base_addr + i as u64 * slot_size;
                fiber.end = fiber.begin;
                fiber.finished = false;
                self.num_fibers += 1;
                return Some(i as u32);
            }
        }
        None
    }

    pub fn free(&mut self, idx: u32) {
        debug_assert!(self.num_fibers > 0);
        self.num_fibers -= 1;
        self.fibers[idx as usize].clear();
    }
}

#[derive(Debug, Default, Clone)]
pub struct InputFiber {
    pub a_value: f64,
    pub b_row_ptr: u32,
    pub b_row_end: u32,
    pub c_partial: Option<u32>,
}

impl InputFiber {
    pub fn from_partial(idx: u32) -> Self {
        InputFiber {
            a_value: 1.0,
            c_partial: Some(idx),
            ..Default::default()
        }
    }

    pub fn finished(&self, pool: &PartialPool) -> bool {
        match self.c_partial {
            Some(idx) => pool.get(idx).is_finished(),
            None => self.b_row_ptr == self.b_row_end,
        }
    }
}

/// Unit of work for one PE: up to radix input fibers merging into either a
/// final C row or a pool slot.
#[derive(Debug, Default, Clone)]
pub struct Task {
    pub inputs: Vec<InputFiber>,
    pub c_row_ptr: u32,
    pub c_row_idx: u32,
    pub c_partial: Option<u32>,
}

impl Task {
    pub fn valid(&self) -> bool {
        !self.inputs.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct InputBuffer {
    pub num_elements_received: usize,
    pub num_elems_fetched_cur_task: usize,
    pub pending_reqs: VecDeque<(Addr, usize, bool)>,
    pub col_idx: VecDeque<u32>,
    pub values: VecDeque<f64>,
}

#[derive(Debug, Default)]
pub struct PeStats {
    pub num_mults: usize,
    pub num_adds: usize,
    pub num_finished_rows: usize,
    pub num_c_partial_rows: usize,
    pub num_c_partial_elements: usize,
    pub idle_cycles: usize,
    pub b_data_stalls: usize,
    pub write_stalls: usize,
    pub c_writes: usize,
    pub max_bytes_write: usize,
}

/// One radix-R processing element: a multi-way merger with a single
/// accumulator and a bounded output-write byte budget.
pub struct Pe {
    pub cur_task: Task,
    pub next_task: Task,
    pub cur_task_finished: bool,
    c_col_idx: u32,
    c_value: f64,
    pub input_buffers: Vec<InputBuffer>,
    read_arbiter: usize,
    pub write_address: Addr,
    pub num_bytes_write: usize,
    radix: usize,
    input_buffer_size: usize,
    output_buffer_size: usize,
}

impl Pe {
    pub fn new(radix: usize, input_buffer_size: usize, output_buffer_size: usize) -> Self {
        let mut pe = Pe {
            cur_task: Task::default(),
            next_task: Task::default(),
            cur_task_finished: false,
            c_col_idx: INVALID_IDX,
            c_value: 0.0,
            input_buffers: Vec::new(),
            read_arbiter: usize::MAX,
            write_address: INVALID_ADDR,
            num_bytes_write: 0,
            radix,
            input_buffer_size,
            output_buffer_size,
        };
        pe.reset();
        pe
    }

    pub fn reset(&mut self) {
        self.cur_task = Task::default();
        self.next_task = Task::default();
        self.cur_task_finished = false;
        self.c_col_idx = INVALID_IDX;
        self.c_value = 0.0;
        self.input_buffers = (0..self.radix).map(|_| InputBuffer::default()).collect();
        self.read_arbiter = usize::MAX;
        self.write_address = INVALID_ADDR;
        self.num_bytes_write = 0;
    }

    /// Pick one input (round-robin over the buffers, current task first,
    /// then the staged next task at the same index) and issue one cache-line
    /// request for it. The operand elements move into the input buffer now;
    /// they only become mergeable when the cache response arrives.
    pub fn get_cache_request(
        &mut self,
        mat: &MatrixData,
        pool: &mut PartialPool,
        stats: &mut PeStats,
    ) -> MemRequest {
        if !self.cur_task.valid() {
            return MemRequest::default();
        }
        for _ in 0..self.input_buffers.len() {
            self.read_arbiter = inc_mod(self.read_arbiter, self.input_buffers.len());
            let i = self.read_arbiter;
            let (task, fetching_next_task) =
                if self.cur_task.inputs.len() > i && !self.cur_task.inputs[i].finished(pool) {
                    (&mut self.cur_task, false)
                } else if self.next_task.inputs.len() > i && !self.next_task.inputs[i].finished(pool)
                {
                    (&mut self.next_task, true)
                } else {
                    continue;
                };
            let in_fiber = &mut task.inputs[i];
            let buffer = &mut self.input_buffers[i];
            let num_elements_fetch = match in_fiber.c_partial {
                Some(p) => {
                    let c_num_elements = pool.get(p).col_idx.len();
                    if c_num_elements == 0 {
                        continue;
                    }
                    if c_num_elements >= BLOCK_SIZE {
                        BLOCK_SIZE
                    } else if pool.get(p).finished {
                        c_num_elements
                    } else {
                        continue;
                    }
                }
                None => ((in_fiber.b_row_end - in_fiber.b_row_ptr) as usize)
                    .min(BLOCK_SIZE - in_fiber.b_row_ptr as usize % BLOCK_SIZE),
            };
            if buffer.col_idx.len() + num_elements_fetch > self.input_buffer_size {
                continue;
            }
            let mut address;
            match in_fiber.c_partial {
                Some(p) => {
                    let fiber = pool.get_mut(p);
                    if fiber.begin == fiber.end {
                        continue;
                    }
                    address = fiber.begin;
                    fiber.begin += (num_elements_fetch * ELEMENT_SIZE) as u64;
                    debug_assert!(fiber.end >= fiber.begin);
                    for _ in 0..num_elements_fetch {
                        buffer
                            .col_idx
                            .push_back(fiber.col_idx.pop_front().expect("partial underflow"));
                        if mat.compute_result {
                            buffer
                                .values
                                .push_back(fiber.values.pop_front().expect("partial underflow"));
                        }
                    }
                    if fiber.is_finished() {
                        pool.free(p);
                        in_fiber.c_partial = None;
                    }
                }
                None => {
                    address =
                        mat.b_elements_addr + in_fiber.b_row_ptr as u64 * ELEMENT_SIZE as u64;
                    for j in 0..num_elements_fetch {
                        let idx = in_fiber.b_row_ptr as usize + j;
                        buffer.col_idx.push_back(mat.b.col_idx[idx]);
                        if mat.compute_result {
                            buffer.values.push_back(mat.b.values[idx]);
                        }
                    }
                    in_fiber.b_row_ptr += num_elements_fetch as u32;
                    stats.num_mults += num_elements_fetch;
                    debug_assert!(in_fiber.b_row_end >= in_fiber.b_row_ptr);
                }
            }
            address = round_down_multiple(address, BLOCK_SIZE_BYTES as u64);
            buffer
                .pending_reqs
                .push_back((address, num_elements_fetch, false));
            if !fetching_next_task {
                buffer.num_elems_fetched_cur_task += num_elements_fetch;
            }
            return MemRequest::read(address, i as u32);
        }
        MemRequest::default()
    }

    /// A cache response makes elements visible in FIFO order over the
    /// buffer's outstanding requests.
    pub fn receive_cache_response(&mut self, response: MemResponse) {
        let buffer = &mut self.input_buffers[response.id as usize];
        debug_assert!(!buffer.pending_reqs.is_empty());
        for req in &mut buffer.pending_reqs {
            if req.0 == response.address {
                req.2 = true;
                break;
            }
        }
        while let Some(&(_, num, done)) = buffer.pending_reqs.front() {
            if !done {
                break;
            }
            buffer.num_elements_received += num;
            buffer.pending_reqs.pop_front();
        }
        debug_assert!(buffer.num_elements_received <= buffer.col_idx.len());
    }

    /// One merger step: select the minimum head among unfinished inputs,
    /// multiply-add into the accumulator, or flush it on a new key.
    pub fn update(&mut self, mat: &mut MatrixData, pool: &mut PartialPool, stats: &mut PeStats) {
        if !self.cur_task.valid() {
            stats.idle_cycles += 1;
            return;
        }
        if self.cur_task_finished {
            return;
        }
        if self.num_bytes_write + ELEMENT_SIZE > self.output_buffer_size * ELEMENT_SIZE {
            stats.write_stalls += 1;
            return;
        }
        let mut min_col_idx = INVALID_IDX;
        let mut min_idx = usize::MAX;
        let mut finished_inputs = 0;
        let mut stall = false;
        for i in 0..self.cur_task.inputs.len() {
            if self.input_buffers[i].num_elems_fetched_cur_task == 0
                && self.cur_task.inputs[i].finished(pool)
            {
                finished_inputs += 1;
                continue;
            }
            if self.input_buffers[i].num_elements_received == 0 {
                stall = true;
                continue;
            }
            let head = *self.input_buffers[i].col_idx.front().expect("buffer empty");
            if head < min_col_idx {
                min_col_idx = head;
                min_idx = i;
            }
        }
        if finished_inputs == self.cur_task.inputs.len() {
            // all inputs drained: flush the accumulator and finish the task
            self.cur_task_finished = true;
            debug_assert!(self.c_col_idx != INVALID_IDX);
            match self.cur_task.c_partial {
                Some(p) => {
                    let fiber = pool.get_mut(p);
                    fiber.col_idx.push_back(self.c_col_idx);
                    if mat.compute_result {
                        fiber.values.push_back(self.c_value);
                    }
                    fiber.finished = true;
                    stats.num_c_partial_elements += 1;
                    stats.num_c_partial_rows += 1;
                }
                None => {
                    if mat.compute_result {
                        mat.c.col_idx[self.cur_task.c_row_ptr as usize] = self.c_col_idx;
                        mat.c.values[self.cur_task.c_row_ptr as usize] = self.c_value;
                    }
                    self.cur_task.c_row_ptr += 1;
                    mat.c.row_end[self.cur_task.c_row_idx as usize] = self.cur_task.c_row_ptr;
                    mat.c.nnz += 1;
                    stats.num_finished_rows += 1;
                }
            }
            self.num_bytes_write += ELEMENT_SIZE;
            stats.max_bytes_write = stats.max_bytes_write.max(self.num_bytes_write);
            self.c_col_idx = INVALID_IDX;
            self.c_value = 0.0;
            return;
        }
        if stall {
            stats.b_data_stalls += 1;
            return;
        }
        debug_assert!(min_idx != usize::MAX);
        // one multiply-add
        if self.c_col_idx == INVALID_IDX {
            self.c_col_idx = min_col_idx;
            if mat.compute_result {
                self.c_value = self.cur_task.inputs[min_idx].a_value
                    * self.input_buffers[min_idx].values.front().expect("no value");
            }
        } else if min_col_idx > self.c_col_idx {
            // new key: flush the accumulator to the task destination
            match self.cur_task.c_partial {
                Some(p) => {
                    stats.num_c_partial_elements += 1;
                    let fiber = pool.get_mut(p);
                    fiber.col_idx.push_back(self.c_col_idx);
                    if mat.compute_result {
                        fiber.values.push_back(self.c_value);
                    }
                }
                None => {
                    mat.c.nnz += 1;
                    if mat.compute_result {
                        mat.c.values[self.cur_task.c_row_ptr as usize] = self.c_value;
                        mat.c.col_idx[self.cur_task.c_row_ptr as usize] = self.c_col_idx;
                    }
                    self.cur_task.c_row_ptr += 1;
                }
            }
            self.num_bytes_write += ELEMENT_SIZE;
            stats.max_bytes_write = stats.max_bytes_write.max(self.num_bytes_write);
            self.c_col_idx = min_col_idx;
            if mat.compute_result {
                self.c_value = self.cur_task.inputs[min_idx].a_value
                    * self.input_buffers[min_idx].values.front().expect("no value");
            }
        } else {
            // the selected head is the strict minimum, so it can never be
            // smaller than a previously flushed key
            debug_assert!(min_col_idx == self.c_col_idx);
            stats.num_adds += 1;
            if mat.compute_result {
                self.c_value += self.cur_task.inputs[min_idx].a_value
                    * self.input_buffers[min_idx].values.front().expect("no value");
            }
        }
        let buffer = &mut self.input_buffers[min_idx];
        buffer.num_elements_received -= 1;
        buffer.num_elems_fetched_cur_task -= 1;
        buffer.col_idx.pop_front();
        if mat.compute_result {
            buffer.values.pop_front();
        }
    }
}
