use std::collections::{HashMap, VecDeque};

use anyhow::{bail, Context, Result};

use crate::base::fetcher::ArrayFetcher;
use crate::base::math::{div_ceil, inc_mod};
use crate::base::port::{EmptyMsg, Port};
use crate::base::{Addr, BLOCK_SIZE, BLOCK_SIZE_BYTES, ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX};
use crate::forest::matb::MatBFetcher;
use crate::forest::{CacheRead, CacheResponse, CacheWrite, CacheWriteKind, PrefetchedRow};
use crate::matrix::data::MatrixData;
use crate::sim::config::{LinkedListCacheConfig, MergeTreeConfig};
use crate::sim::mem::MemPort;

pub type CacheReadSlavePort = Port<CacheResponse, CacheRead>;
pub type CacheWriteSlavePort = Port<u32, CacheWrite>;
pub type PrefetchPort = Port<Vec<PrefetchedRow>, EmptyMsg>;

/// One cache block in a row chain. For the tail block of a B row, `next`
/// holds the row's `B_row_ptr` key so the owning entry in the active-row
/// table can be found when the tail is consumed.
#[derive(Debug, Clone, Copy)]
struct LinkedListNode {
    num_elements: u32,
    next: u32,
    last: bool,
    c_partial_row: bool,
}

impl Default for LinkedListNode {
    fn default() -> Self {
        LinkedListNode {
            num_elements: 0,
            next: INVALID_IDX,
            last: true,
            c_partial_row: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ActiveRow {
    row_head: u32,
    num_uses: u32,
    num_blocks: u32,
}

#[derive(Debug, Clone, Copy)]
struct InactiveRow {
    b_row_ptr: u32,
    row_head: u32,
    num_blocks: u32,
    prev: u32,
    next: u32,
}

impl Default for InactiveRow {
    fn default() -> Self {
        InactiveRow {
            b_row_ptr: INVALID_IDX,
            row_head: 0,
            num_blocks: 0,
            prev: 0,
            next: 0,
        }
    }
}

impl InactiveRow {
    fn valid(&self) -> bool {
        self.b_row_ptr != INVALID_IDX
    }
}

/// Row-granularity cache: each B row is a singly linked chain of blocks.
/// Rows with outstanding uses live in a hash table and cannot be evicted;
/// rows that drop to zero uses move to a set-associative LRU table whose
/// chains are reclaimed when block allocation runs dry.
pub struct LinkedListCache {
    mem_ports: Vec<MemPort>,
    prefetch_port: PrefetchPort,
    read_ports: Vec<CacheReadSlavePort>,
    write_port: CacheWriteSlavePort,
    arbiter: usize,

    b_row_ptr_end_fetcher: ArrayFetcher<(u32, u32)>,
    matb_fetcher: MatBFetcher,
    pending_reqs: HashMap<u32, Vec<(usize, u32)>>,
    finished_reqs: Vec<VecDeque<CacheResponse>>,

    active_rows: HashMap<u32, ActiveRow>,
    inactive_rows_cache: Vec<InactiveRow>,
    row_data_list: Vec<LinkedListNode>,
    free_list_heads: VecDeque<u32>,
    inactive_rows_list_head: u32,
    inactive_rows_list_tail: u32,
    num_inactive_rows: usize,
    c_partial_row_ptr: u32,
    num_active_blocks: usize,
    num_inactive_blocks: usize,
    num_c_partial_blocks: usize,
    num_free_blocks: usize,
    num_fetching_blocks: usize,
    cycles: usize,

    b_elements_addr: Addr,

    // config
    pub num_blocks: usize,
    max_active_rows: usize,
    inactive_rows_assoc: usize,
    inactive_rows_num_sets: usize,
    num_banks: usize,
    prefetched_rows_per_cycle: usize,
    sample_interval: usize,
    // stats
    pub reads: usize,
    pub writes: usize,
    pub preproc_a_reads: usize,
    pub b_reads: usize,
    pub b_elements_read: usize,
    pub c_partial_reads: usize,
    pub c_partial_writes: usize,
    pub reused_rows: usize,
    pub fetched_rows: usize,
    pub evictions: usize,
    pub num_active_blocks_avg: usize,
    pub num_inactive_blocks_avg: usize,
    pub num_c_partial_blocks_avg: usize,
    pub num_free_blocks_avg: usize,
    pub num_samples: usize,
    pub max_free_lists: usize,
    pub stats_max_active_rows: usize,
    pub stats_max_inactive_rows: usize,
    pub stats_max_fetched_rows: usize,
    pub stats_max_outstanding_reqs: usize,
}

impl LinkedListCache {
    pub fn new(
        config: &LinkedListCacheConfig,
        tree_config: &MergeTreeConfig,
        mat: &MatrixData,
    ) -> Result<Self> {
        let num_read_ports = tree_config
            .num_merge_trees
            .context("missing key merge_tree_manager.num_merge_trees")?;
        let max_fetched_rows = config
            .max_fetched_rows
            .context("missing key linked_list_cache.max_fetched_rows")?;
        let num_blocks = config.size / BLOCK_SIZE_BYTES;
        let mut cache = LinkedListCache {
            mem_ports: (0..config.num_mem_ports + 1).map(|_| Port::new()).collect(),
            prefetch_port: Port::new(),
            read_ports: (0..num_read_ports).map(|_| Port::new()).collect(),
            write_port: Port::new(),
            arbiter: usize::MAX,
            b_row_ptr_end_fetcher: ArrayFetcher::new(mat.preproc_b_row_ptr_end.clone()),
            matb_fetcher: MatBFetcher::new(max_fetched_rows, config.max_outstanding_reqs),
            pending_reqs: HashMap::new(),
            finished_reqs: vec![VecDeque::new(); num_read_ports],
            active_rows: HashMap::new(),
            inactive_rows_cache: vec![InactiveRow::default(); config.max_inactive_rows],
            row_data_list: vec![LinkedListNode::default(); num_blocks],
            free_list_heads: VecDeque::new(),
            inactive_rows_list_head: INVALID_IDX,
            inactive_rows_list_tail: INVALID_IDX,
            num_inactive_rows: 0,
            c_partial_row_ptr: INVALID_IDX,
            num_active_blocks: 0,
            num_inactive_blocks: 0,
            num_c_partial_blocks: 0,
            num_free_blocks: num_blocks,
            num_fetching_blocks: 0,
            cycles: 0,
            b_elements_addr: mat.b_elements_addr,
            num_blocks,
            max_active_rows: config.max_active_rows,
            inactive_rows_assoc: config.inactive_rows_assoc,
            inactive_rows_num_sets: config.max_inactive_rows / config.inactive_rows_assoc,
            num_banks: config.num_banks.unwrap_or(num_read_ports),
            prefetched_rows_per_cycle: config.prefetched_rows_per_cycle,
            sample_interval: config.sample_interval,
            reads: 0,
            writes: 0,
            preproc_a_reads: 0,
            b_reads: 0,
            b_elements_read: 0,
            c_partial_reads: 0,
            c_partial_writes: 0,
            reused_rows: 0,
            fetched_rows: 0,
            evictions: 0,
            num_active_blocks_avg: 0,
            num_inactive_blocks_avg: 0,
            num_c_partial_blocks_avg: 0,
            num_free_blocks_avg: 0,
            num_samples: 0,
            max_free_lists: 0,
            stats_max_active_rows: 0,
            stats_max_inactive_rows: 0,
            stats_max_fetched_rows: 0,
            stats_max_outstanding_reqs: 0,
        };
        cache.b_row_ptr_end_fetcher.buffer_size = max_fetched_rows;
        Ok(cache)
    }

    pub fn num_mem_ports(&self) -> usize {
        self.mem_ports.len()
    }

    pub fn mem_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.mem_ports[id]
    }

    pub fn prefetch_port_mut(&mut self) -> &mut PrefetchPort {
        &mut self.prefetch_port
    }

    pub fn read_port_mut(&mut self, id: usize) -> &mut CacheReadSlavePort {
        &mut self.read_ports[id]
    }

    pub fn write_port_mut(&mut self) -> &mut CacheWriteSlavePort {
        &mut self.write_port
    }

    pub fn reset(&mut self, mat: &MatrixData) {
        for port in &mut self.mem_ports {
            port.reset();
        }
        self.prefetch_port.reset();
        for port in &mut self.read_ports {
            port.reset();
        }
        self.write_port.reset();
        self.arbiter = 0;
        self.b_row_ptr_end_fetcher
            .reset(mat.preproc_b_row_ptr_end.clone(), mat.preproc_b_row_ptr_end_addr);
        self.b_elements_addr = mat.b_elements_addr;
        self.matb_fetcher.reset();
        self.pending_reqs.clear();
        for queue in &mut self.finished_reqs {
            queue.clear();
        }
        self.active_rows.clear();
        self.inactive_rows_cache.fill(InactiveRow::default());
        // all blocks form one free-list chain
        let num_blocks = self.row_data_list.len();
        for i in 0..num_blocks - 1 {
            self.row_data_list[i] = LinkedListNode {
                num_elements: 0,
                next: i as u32 + 1,
                last: false,
                c_partial_row: false,
            };
        }
        self.row_data_list[num_blocks - 1] = LinkedListNode::default();
        self.free_list_heads.clear();
        self.free_list_heads.push_back(0);
        self.c_partial_row_ptr = INVALID_IDX;
        self.inactive_rows_list_head = INVALID_IDX;
        self.inactive_rows_list_tail = INVALID_IDX;
        self.num_inactive_rows = 0;
        self.num_active_blocks = 0;
        self.num_inactive_blocks = 0;
        self.num_c_partial_blocks = 0;
        self.num_free_blocks = num_blocks;
        self.num_fetching_blocks = 0;
        self.cycles = 0;
        self.reads = 0;
        self.writes = 0;
        self.preproc_a_reads = 0;
        self.b_reads = 0;
        self.b_elements_read = 0;
        self.c_partial_reads = 0;
        self.c_partial_writes = 0;
        self.reused_rows = 0;
        self.fetched_rows = 0;
        self.evictions = 0;
        self.num_active_blocks_avg = 0;
        self.num_inactive_blocks_avg = 0;
        self.num_c_partial_blocks_avg = 0;
        self.num_free_blocks_avg = 0;
        self.num_samples = 0;
        self.max_free_lists = 0;
        self.stats_max_active_rows = 0;
        self.stats_max_inactive_rows = 0;
        self.stats_max_fetched_rows = 0;
        self.stats_max_outstanding_reqs = 0;
    }

    pub fn update(&mut self) {
        // B-data requests on all ports but the last
        for i in 0..self.mem_ports.len() - 1 {
            if !self.mem_ports[i].has_msg_send() {
                let request = self.matb_fetcher.get_request();
                if request.valid() {
                    self.mem_ports[i].add_msg_send(request);
                    self.stats_max_outstanding_reqs = self
                        .stats_max_outstanding_reqs
                        .max(self.matb_fetcher.num_outstanding_reqs);
                    self.b_reads += 1;
                }
            }
            self.mem_ports[i].transfer();
        }
        // last port streams the preprocessed B row list
        let last = self.mem_ports.len() - 1;
        if !self.mem_ports[last].has_msg_send() {
            let addr = self.b_row_ptr_end_fetcher.get_fetch_address();
            if addr != INVALID_ADDR {
                self.mem_ports[last].add_msg_send(crate::sim::mem::MemRequest::read(addr, 0));
                self.preproc_a_reads += 1;
            }
        }
        self.mem_ports[last].transfer();
        // admit the next few rows and advertise their head blocks
        if !self.prefetch_port.has_msg_send() {
            let mut prefetched_rows = Vec::new();
            for _ in 0..self.prefetched_rows_per_cycle {
                if self.b_row_ptr_end_fetcher.num_elements == 0 {
                    break;
                }
                let (b_row_ptr, b_row_end) = self.b_row_ptr_end_fetcher.front();
                let row_head_ptr = self.add_new_row(b_row_ptr, b_row_end);
                if row_head_ptr == INVALID_IDX {
                    break;
                }
                self.b_row_ptr_end_fetcher.pop();
                prefetched_rows.push(PrefetchedRow {
                    b_row_ptr,
                    row_head_ptr,
                });
            }
            if !prefetched_rows.is_empty() {
                self.prefetch_port.add_msg_send(prefetched_rows);
            }
        }
        self.prefetch_port.transfer();
        if self.cycles == 0 {
            self.sample_cache_utilization();
        }
        self.cycles = inc_mod(self.cycles, self.sample_interval);
    }

    pub fn apply(&mut self) -> Result<()> {
        self.write_b_row_data();
        for i in 0..self.mem_ports.len() - 1 {
            if let Some(response) = self.mem_ports[i].take_msg_received() {
                self.matb_fetcher.put_response(&response);
            }
        }
        let last = self.mem_ports.len() - 1;
        if let Some(response) = self.mem_ports[last].take_msg_received() {
            self.b_row_ptr_end_fetcher.receive_data(response.address);
        }
        self.receive_read_requests();
        self.send_read_responses();
        if let Some(request) = self.write_port.take_msg_received() {
            let response = self.write_c_partial_row(request)?;
            if response != INVALID_IDX {
                debug_assert!(!self.write_port.has_msg_send());
                self.write_port.add_msg_send(response);
            }
        }
        for port in &mut self.read_ports {
            port.transfer();
        }
        self.write_port.transfer();
        Ok(())
    }

    /// Admit one B row: bump its use count if active, promote it if
    /// inactive, else claim a head block and queue the row for fetching.
    /// Returns the head block index or `INVALID_IDX` if not admissible yet.
    fn add_new_row(&mut self, b_row_ptr: u32, b_row_end: u32) -> u32 {
        if let Some(row) = self.active_rows.get_mut(&b_row_ptr) {
            row.num_uses += 1;
            self.reused_rows += 1;
            return row.row_head;
        }
        if self.active_rows.len() == self.max_active_rows {
            return INVALID_IDX;
        }
        let index = b_row_ptr as usize % self.inactive_rows_num_sets;
        for i in 0..self.inactive_rows_assoc {
            let pos = index * self.inactive_rows_assoc + i;
            if self.inactive_rows_cache[pos].b_row_ptr != b_row_ptr {
                continue;
            }
            let inactive = self.inactive_rows_cache[pos];
            self.active_rows.insert(
                b_row_ptr,
                ActiveRow {
                    row_head: inactive.row_head,
                    num_uses: 1,
                    num_blocks: inactive.num_blocks,
                },
            );
            self.stats_max_active_rows = self.stats_max_active_rows.max(self.active_rows.len());
            self.num_active_blocks += inactive.num_blocks as usize;
            self.num_inactive_blocks -= inactive.num_blocks as usize;
            debug_assert!(self.blocks_accounted());
            self.inactive_rows_list_remove(pos);
            self.reused_rows += 1;
            return inactive.row_head;
        }
        if !self.matb_fetcher.can_accept_row() {
            return INVALID_IDX;
        }
        let row_num_blocks = div_ceil((b_row_end - b_row_ptr) as u64, BLOCK_SIZE as u64) as usize;
        debug_assert!(self.num_free_blocks + self.num_inactive_blocks >= self.num_fetching_blocks);
        if row_num_blocks
            > self.num_free_blocks + self.num_inactive_blocks - self.num_fetching_blocks
        {
            return INVALID_IDX;
        }
        let ptr = self.allocate_block();
        debug_assert!(ptr != INVALID_IDX);
        // stash the row key in the head block until the chain grows
        self.row_data_list[ptr as usize].next = b_row_ptr;
        let begin = self.b_elements_addr + b_row_ptr as u64 * ELEMENT_SIZE as u64;
        let end = self.b_elements_addr + b_row_end as u64 * ELEMENT_SIZE as u64;
        self.matb_fetcher.add_row(begin, end, ptr);
        self.stats_max_fetched_rows = self
            .stats_max_fetched_rows
            .max(self.matb_fetcher.num_rows_fetch);
        self.active_rows.insert(
            b_row_ptr,
            ActiveRow {
                row_head: ptr,
                num_uses: 1,
                num_blocks: row_num_blocks as u32,
            },
        );
        self.stats_max_active_rows = self.stats_max_active_rows.max(self.active_rows.len());
        self.num_fetching_blocks += row_num_blocks;
        debug_assert!(self.num_free_blocks + self.num_inactive_blocks >= self.num_fetching_blocks);
        self.fetched_rows += 1;
        ptr
    }

    /// Commit ready blocks from the row fetchers into chains and wake any
    /// readers parked on them.
    fn write_b_row_data(&mut self) {
        for i in 0..self.matb_fetcher.row_fetchers.len() {
            let (num_elements, ptr, last) = self.matb_fetcher.row_fetchers[i].get_data();
            if num_elements == 0 {
                continue;
            }
            debug_assert!(self.num_fetching_blocks > 0);
            self.num_fetching_blocks -= 1;
            debug_assert!(self.num_free_blocks > 0);
            self.num_free_blocks -= 1;
            self.num_active_blocks += 1;
            debug_assert!(self.blocks_accounted());
            self.row_data_list[ptr as usize].num_elements = num_elements;
            self.b_elements_read += num_elements as usize;
            if last {
                self.matb_fetcher.num_rows_fetch -= 1;
            } else {
                self.row_data_list[ptr as usize].last = false;
                let new_block_ptr = self.allocate_block();
                debug_assert!(new_block_ptr != INVALID_IDX);
                // the row key travels to the new tail
                self.row_data_list[new_block_ptr as usize].next =
                    self.row_data_list[ptr as usize].next;
                self.row_data_list[ptr as usize].next = new_block_ptr;
                self.matb_fetcher.row_fetchers[i].row_ptr = new_block_ptr;
            }
            self.finish_pending_reqs(ptr);
        }
    }

    fn receive_read_requests(&mut self) {
        for i in 0..self.read_ports.len() {
            let Some(request) = self.read_ports[i].take_msg_received() else {
                continue;
            };
            debug_assert!(request.valid());
            let row_block = self.row_data_list[request.row_ptr as usize];
            if row_block.num_elements == 0 || (!row_block.last && row_block.next == INVALID_IDX) {
                self.pending_reqs
                    .entry(request.row_ptr)
                    .or_default()
                    .push((i, request.id));
            } else {
                let response = CacheResponse {
                    row_ptr: if row_block.last {
                        INVALID_IDX
                    } else {
                        row_block.next
                    },
                    num_elements: row_block.num_elements,
                    id: request.id,
                };
                self.finished_reqs[i].push_back(response);
                self.update_cache_block(request.row_ptr);
            }
            self.reads += 1;
        }
    }

    /// At most `num_banks` response sends per cycle, round-robin.
    fn send_read_responses(&mut self) {
        let mut num_responses = 0;
        for _ in 0..self.read_ports.len() {
            self.arbiter = inc_mod(self.arbiter, self.read_ports.len());
            if let Some(response) = self.finished_reqs[self.arbiter].pop_front() {
                debug_assert!(!self.read_ports[self.arbiter].has_msg_send());
                self.read_ports[self.arbiter].add_msg_send(response);
            }
            num_responses += 1;
            if num_responses == self.num_banks {
                break;
            }
        }
    }

    fn finish_pending_reqs(&mut self, ptr: u32) {
        let Some(waiters) = self.pending_reqs.remove(&ptr) else {
            return;
        };
        for (port, id) in waiters {
            let row_block = self.row_data_list[ptr as usize];
            let response = CacheResponse {
                row_ptr: if row_block.last {
                    INVALID_IDX
                } else {
                    row_block.next
                },
                num_elements: row_block.num_elements,
                id,
            };
            self.finished_reqs[port].push_back(response);
            self.update_cache_block(ptr);
        }
    }

    /// Bookkeeping after a block has been read: C-partial blocks are
    /// one-shot and freed, B-row tails drop the owning row's use count.
    fn update_cache_block(&mut self, ptr: u32) {
        let node = self.row_data_list[ptr as usize];
        if node.c_partial_row {
            self.row_data_list[ptr as usize].num_elements = 0;
            self.row_data_list[ptr as usize].c_partial_row = false;
            debug_assert!(self.num_c_partial_blocks != 0);
            self.num_c_partial_blocks -= 1;
            self.num_free_blocks += 1;
            debug_assert!(self.blocks_accounted());
            if self.free_list_heads.is_empty() {
                self.row_data_list[ptr as usize].next = INVALID_IDX;
                self.row_data_list[ptr as usize].last = true;
                self.free_list_heads.push_back(ptr);
            } else {
                self.row_data_list[ptr as usize].next =
                    *self.free_list_heads.back().expect("free list empty");
                self.row_data_list[ptr as usize].last = false;
                *self.free_list_heads.back_mut().expect("free list empty") = ptr;
            }
        } else if node.last {
            let key = node.next;
            let row = self
                .active_rows
                .get_mut(&key)
                .expect("tail block without active row");
            row.num_uses -= 1;
            if row.num_uses == 0 {
                let entry = (key, *row);
                self.active_rows.remove(&key);
                self.add_to_inactive_rows(entry);
            }
        }
    }

    /// Append one block to the in-flight C-partial chain. Replies with the
    /// head pointer only for the first block of a row.
    fn write_c_partial_row(&mut self, request: CacheWrite) -> Result<u32> {
        let new_block_ptr = self.allocate_block();
        if new_block_ptr == INVALID_IDX {
            bail!("linked list cache has no space for partial row");
        }
        self.writes += 1;
        debug_assert!(self.num_free_blocks > 0);
        self.num_free_blocks -= 1;
        self.num_c_partial_blocks += 1;
        debug_assert!(self.blocks_accounted());
        self.row_data_list[new_block_ptr as usize].c_partial_row = true;
        self.row_data_list[new_block_ptr as usize].num_elements = request.num_elements;
        let mut response = INVALID_IDX;
        if self.c_partial_row_ptr == INVALID_IDX {
            self.c_partial_row_ptr = new_block_ptr;
            response = new_block_ptr;
        } else {
            self.row_data_list[self.c_partial_row_ptr as usize].next = new_block_ptr;
            let prev = self.c_partial_row_ptr;
            self.c_partial_row_ptr = new_block_ptr;
            self.finish_pending_reqs(prev);
        }
        if request.kind != CacheWriteKind::WriteLast {
            self.row_data_list[self.c_partial_row_ptr as usize].last = false;
        } else {
            let last_ptr = self.c_partial_row_ptr;
            self.c_partial_row_ptr = INVALID_IDX;
            self.finish_pending_reqs(last_ptr);
        }
        Ok(response)
    }

    /// Pull a block from the free lists, reclaiming the LRU-oldest inactive
    /// row if all lists are empty.
    fn allocate_block(&mut self) -> u32 {
        if self.free_list_heads.is_empty() && !self.free_inactive_row() {
            return INVALID_IDX;
        }
        let head = *self.free_list_heads.front().expect("free list empty");
        if self.row_data_list[head as usize].last {
            self.free_list_heads.pop_front();
        } else {
            *self.free_list_heads.front_mut().expect("free list empty") =
                self.row_data_list[head as usize].next;
        }
        self.row_data_list[head as usize] = LinkedListNode::default();
        head
    }

    fn free_inactive_row(&mut self) -> bool {
        if self.inactive_rows_list_head == INVALID_IDX {
            return false;
        }
        debug_assert!(self.free_list_heads.is_empty());
        let head = self.inactive_rows_list_head as usize;
        debug_assert!(self.inactive_rows_cache[head].valid());
        let num_blocks = self.inactive_rows_cache[head].num_blocks as usize;
        debug_assert!(self.num_inactive_blocks >= num_blocks);
        self.num_inactive_blocks -= num_blocks;
        self.num_free_blocks += num_blocks;
        debug_assert!(self.blocks_accounted());
        debug_assert!(self.num_inactive_rows > 0);
        self.num_inactive_rows -= 1;
        self.evictions += 1;
        self.free_list_heads
            .push_back(self.inactive_rows_cache[head].row_head);
        self.inactive_rows_list_head = self.inactive_rows_cache[head].next;
        self.inactive_rows_cache[head] = InactiveRow::default();
        if self.inactive_rows_list_head == INVALID_IDX {
            self.inactive_rows_list_tail = INVALID_IDX;
        } else {
            self.inactive_rows_cache[self.inactive_rows_list_head as usize].prev = INVALID_IDX;
        }
        self.max_free_lists = self.max_free_lists.max(self.free_list_heads.len());
        true
    }

    /// A row whose uses dropped to zero parks in the set-associative table,
    /// appended at the LRU tail. A set conflict evicts the smallest row in
    /// the set straight onto the free lists.
    fn add_to_inactive_rows(&mut self, active_row: (u32, ActiveRow)) {
        let (b_row_ptr, row) = active_row;
        debug_assert!(self.num_active_blocks >= row.num_blocks as usize);
        self.num_active_blocks -= row.num_blocks as usize;
        self.num_inactive_blocks += row.num_blocks as usize;
        debug_assert!(self.blocks_accounted());
        let index = b_row_ptr as usize % self.inactive_rows_num_sets;
        let mut pos = 0;
        let mut min_row_num_blocks = u32::MAX;
        for i in 0..self.inactive_rows_assoc {
            let entry = &self.inactive_rows_cache[index * self.inactive_rows_assoc + i];
            if !entry.valid() {
                pos = i;
                break;
            }
            if entry.num_blocks < min_row_num_blocks {
                min_row_num_blocks = entry.num_blocks;
                pos = i;
            }
        }
        pos += index * self.inactive_rows_assoc;
        if self.inactive_rows_cache[pos].valid() {
            let victim_blocks = self.inactive_rows_cache[pos].num_blocks as usize;
            self.num_inactive_blocks -= victim_blocks;
            self.num_free_blocks += victim_blocks;
            debug_assert!(self.blocks_accounted());
            self.free_list_heads
                .push_back(self.inactive_rows_cache[pos].row_head);
            self.inactive_rows_list_remove(pos);
            self.evictions += 1;
            self.max_free_lists = self.max_free_lists.max(self.free_list_heads.len());
        }
        self.inactive_rows_cache[pos] = InactiveRow {
            b_row_ptr,
            row_head: row.row_head,
            num_blocks: row.num_blocks,
            prev: self.inactive_rows_list_tail,
            next: INVALID_IDX,
        };
        if self.inactive_rows_list_tail == INVALID_IDX {
            debug_assert!(self.num_inactive_rows == 0);
            debug_assert!(self.inactive_rows_list_head == INVALID_IDX);
            self.inactive_rows_list_head = pos as u32;
        } else {
            let tail = self.inactive_rows_list_tail as usize;
            self.inactive_rows_cache[tail].next = pos as u32;
        }
        self.inactive_rows_list_tail = pos as u32;
        self.num_inactive_rows += 1;
        self.stats_max_inactive_rows = self.stats_max_inactive_rows.max(self.num_inactive_rows);
    }

    fn inactive_rows_list_remove(&mut self, pos: usize) {
        debug_assert!(self.num_inactive_rows > 0);
        let entry = self.inactive_rows_cache[pos];
        if entry.next != INVALID_IDX {
            self.inactive_rows_cache[entry.next as usize].prev = entry.prev;
        } else {
            self.inactive_rows_list_tail = entry.prev;
        }
        if entry.prev != INVALID_IDX {
            self.inactive_rows_cache[entry.prev as usize].next = entry.next;
        } else {
            self.inactive_rows_list_head = entry.next;
        }
        self.inactive_rows_cache[pos] = InactiveRow::default();
        self.num_inactive_rows -= 1;
    }

    fn blocks_accounted(&self) -> bool {
        self.num_active_blocks
            + self.num_inactive_blocks
            + self.num_c_partial_blocks
            + self.num_free_blocks
            <= self.row_data_list.len()
    }

    fn sample_cache_utilization(&mut self) {
        self.num_active_blocks_avg += self.num_active_blocks;
        self.num_inactive_blocks_avg += self.num_inactive_blocks;
        self.num_c_partial_blocks_avg += self.num_c_partial_blocks;
        self.num_free_blocks_avg += self.num_free_blocks;
        self.num_samples += 1;
    }

    pub fn block_occupancy(&self) -> (usize, usize, usize, usize) {
        (
            self.num_active_blocks,
            self.num_inactive_blocks,
            self.num_c_partial_blocks,
            self.num_free_blocks,
        )
    }
}
