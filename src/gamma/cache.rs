use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::base::math::{inc_mod, round_down_multiple, round_up_multiple};
use crate::base::port::{EmptyMsg, Port};
use crate::base::{Addr, BLOCK_SIZE, BLOCK_SIZE_BYTES, ELEMENT_SIZE, MEM_TRANSACTION_SIZE};
use crate::matrix::data::MatrixData;
use crate::sim::config::FiberCacheConfig;
use crate::sim::mem::{MemPort, MemRequest, MemResponse};

pub type SlavePort = Port<MemResponse, MemRequest>;
pub type PrefetchPort = Port<EmptyMsg, usize>;

/// In-flight block fill. Coalesces readers that arrive while the three
/// memory transactions are outstanding; `num_uses` accumulates prefetch
/// reservations made before the line lands.
#[derive(Default)]
struct PendingRead {
    dest_ids: Vec<(usize, u32)>,
    num_arrived_reqs: u32,
    num_uses: u32,
    c_partial: bool,
}

#[derive(Default)]
struct Bank {
    mem_reqs: VecDeque<MemRequest>,
    read_arbiter: usize,
    write_arbiter: usize,
}

#[derive(Clone, Copy)]
struct CacheLine {
    address: Addr,
    num_uses: u32,
    c_partial: bool,
}

impl CacheLine {
    fn invalid() -> Self {
        CacheLine {
            address: crate::base::INVALID_ADDR,
            num_uses: 0,
            c_partial: false,
        }
    }

    fn valid(&self) -> bool {
        self.address != crate::base::INVALID_ADDR
    }
}

/// Banked set-associative block cache for B fibers and spilled C partials.
///
/// Replacement is by smallest prefetch use count; a C-partial line is only
/// displaced once every line in the set has at most one use left, and its
/// eviction writes the block back to memory.
pub struct FiberCache {
    mem_ports: Vec<MemPort>,
    read_ports: Vec<SlavePort>,
    write_ports: Vec<SlavePort>,
    prefetch_port: PrefetchPort,

    mem_arbiter: usize,
    prefetch_idx: usize,
    prefetch_reqs: VecDeque<MemRequest>,
    banks: Vec<Bank>,
    cache_lines: Vec<CacheLine>,
    pending_reqs: HashMap<Addr, PendingRead>,
    finished_reqs: Vec<VecDeque<MemResponse>>,
    num_b_blocks: usize,
    num_c_partial_blocks: usize,
    cycles: usize,

    preproc_b_row_ptr_end: Arc<Vec<(u32, u32)>>,
    b_elements_addr: Addr,
    c_partials_base_addr: Addr,

    pub num_blocks: usize,
    assoc: usize,
    sample_interval: usize,
    // stats
    pub b_data_reads: usize,
    pub c_partial_reads: usize,
    pub c_partial_writes: usize,
    pub reads: usize,
    pub writes: usize,
    pub read_hits: usize,
    pub b_blocks_avg: usize,
    pub c_partial_blocks_avg: usize,
    pub num_samples: usize,
    #[cfg(debug_assertions)]
    c_addrs: std::collections::HashSet<Addr>,
}

impl FiberCache {
    pub fn new(config: &FiberCacheConfig, num_slave_ports: usize, mat: &MatrixData) -> Result<Self> {
        let num_mem_ports = config
            .num_mem_ports
            .context("missing key fiber_cache.num_mem_ports")?;
        let size = config.size.context("missing key fiber_cache.size")?;
        let num_banks = config
            .num_banks
            .context("missing key fiber_cache.num_banks")?;
        let assoc = config.assoc.context("missing key fiber_cache.assoc")?;
        let num_blocks = size / BLOCK_SIZE_BYTES;
        Ok(FiberCache {
            mem_ports: (0..num_mem_ports).map(|_| Port::new()).collect(),
            read_ports: (0..num_slave_ports).map(|_| Port::new()).collect(),
            write_ports: (0..num_slave_ports).map(|_| Port::new()).collect(),
            prefetch_port: Port::new(),
            mem_arbiter: usize::MAX,
            prefetch_idx: 0,
            prefetch_reqs: VecDeque::new(),
            banks: (0..num_banks).map(|_| Bank::default()).collect(),
            cache_lines: vec![CacheLine::invalid(); num_blocks],
            pending_reqs: HashMap::new(),
            finished_reqs: vec![VecDeque::new(); num_slave_ports],
            num_b_blocks: 0,
            num_c_partial_blocks: 0,
            cycles: 0,
            preproc_b_row_ptr_end: mat.preproc_b_row_ptr_end.clone(),
            b_elements_addr: mat.b_elements_addr,
            c_partials_base_addr: mat.c_partials_base_addr,
            num_blocks,
            assoc,
            sample_interval: config.sample_interval,
            b_data_reads: 0,
            c_partial_reads: 0,
            c_partial_writes: 0,
            reads: 0,
            writes: 0,
            read_hits: 0,
            b_blocks_avg: 0,
            c_partial_blocks_avg: 0,
            num_samples: 0,
            #[cfg(debug_assertions)]
            c_addrs: std::collections::HashSet::new(),
        })
    }

    pub fn mem_port_mut(&mut self, id: usize) -> &mut MemPort {
        &mut self.mem_ports[id]
    }

    pub fn read_port_mut(&mut self, id: usize) -> &mut SlavePort {
        &mut self.read_ports[id]
    }

    pub fn write_port_mut(&mut self, id: usize) -> &mut SlavePort {
        &mut self.write_ports[id]
    }

    pub fn prefetch_port_mut(&mut self) -> &mut PrefetchPort {
        &mut self.prefetch_port
    }

    pub fn num_mem_ports(&self) -> usize {
        self.mem_ports.len()
    }

    pub fn reset(&mut self, mat: &MatrixData) {
        for port in &mut self.mem_ports {
            port.reset();
        }
        for port in &mut self.read_ports {
            port.reset();
        }
        for port in &mut self.write_ports {
            port.reset();
        }
        self.prefetch_port.reset();
        self.mem_arbiter = usize::MAX;
        self.prefetch_idx = 0;
        self.prefetch_reqs.clear();
        for bank in &mut self.banks {
            *bank = Bank::default();
        }
        self.cache_lines.fill(CacheLine::invalid());
        self.pending_reqs.clear();
        for queue in &mut self.finished_reqs {
            queue.clear();
        }
        self.num_b_blocks = 0;
        self.num_c_partial_blocks = 0;
        self.cycles = 0;
        self.preproc_b_row_ptr_end = mat.preproc_b_row_ptr_end.clone();
        self.b_elements_addr = mat.b_elements_addr;
        self.c_partials_base_addr = mat.c_partials_base_addr;
        self.b_data_reads = 0;
        self.c_partial_reads = 0;
        self.c_partial_writes = 0;
        self.reads = 0;
        self.writes = 0;
        self.read_hits = 0;
        self.b_blocks_avg = 0;
        self.c_partial_blocks_avg = 0;
        self.num_samples = 0;
        #[cfg(debug_assertions)]
        self.c_addrs.clear();
    }

    pub fn update(&mut self) {
        // drain finished reads back to the PEs
        for i in 0..self.read_ports.len() {
            if self.read_ports[i].has_msg_send() {
                continue;
            }
            if let Some(resp) = self.finished_reqs[i].pop_front() {
                self.read_ports[i].add_msg_send(resp);
            }
        }
        // memory requests: bank misses have priority over prefetches
        for port in &mut self.mem_ports {
            if port.has_msg_send() {
                continue;
            }
            for _ in 0..self.banks.len() {
                self.mem_arbiter = inc_mod(self.mem_arbiter, self.banks.len());
                if let Some(req) = self.banks[self.mem_arbiter].mem_reqs.pop_front() {
                    port.add_msg_send(req);
                    break;
                }
            }
            if port.has_msg_send() {
                continue;
            }
            if let Some(req) = self.prefetch_reqs.pop_front() {
                port.add_msg_send(req);
            }
        }
        for port in &mut self.read_ports {
            port.transfer();
        }
        for port in &mut self.mem_ports {
            port.transfer();
        }
        self.cycles = inc_mod(self.cycles, self.sample_interval);
        if self.cycles == 0 {
            self.sample_cache_utilization();
        }
    }

    pub fn apply(&mut self) {
        self.receive_mem_responses();
        self.receive_read_requests();
        self.receive_write_requests();
        self.receive_prefetch_data();
    }

    /// No quiescence requirement beyond the PE manager and memory.
    pub fn inactive(&self) -> bool {
        true
    }

    fn receive_mem_responses(&mut self) {
        for i in 0..self.mem_ports.len() {
            let Some(response) = self.mem_ports[i].take_msg_received() else {
                continue;
            };
            let addr = round_down_multiple(response.address, BLOCK_SIZE_BYTES as u64);
            let pending = self
                .pending_reqs
                .get_mut(&addr)
                .expect("response without pending fill");
            pending.num_arrived_reqs += 1;
            // a block is three transactions; the fill is all-or-nothing
            if pending.num_arrived_reqs == 3 {
                let pending = self.pending_reqs.remove(&addr).expect("pending vanished");
                for &(port, id) in &pending.dest_ids {
                    self.finished_reqs[port].push_back(MemResponse { address: addr, id });
                }
                if !pending.c_partial {
                    self.cache_insert(addr, pending.num_uses, false);
                }
            }
        }
    }

    fn receive_read_requests(&mut self) {
        for i in 0..self.banks.len() {
            // one serviced request per bank per cycle
            let mut served = false;
            for _ in 0..self.read_ports.len() {
                self.banks[i].read_arbiter = inc_mod(self.banks[i].read_arbiter, self.read_ports.len());
                let p = self.banks[i].read_arbiter;
                if served {
                    continue;
                }
                let Some(req) = self.read_ports[p].peek_msg_received() else {
                    continue;
                };
                debug_assert!(req.valid());
                if self.address_to_bank(req.address) != i {
                    continue;
                }
                self.process_read_request(p, req);
                self.reads += 1;
                self.read_ports[p].take_msg_received();
                served = true;
            }
        }
    }

    fn process_read_request(&mut self, port: usize, req: MemRequest) {
        if req.address >= self.c_partials_base_addr {
            // forward from an in-flight partial write with the same address
            for write_port in &mut self.write_ports {
                let Some(write_req) = write_port.peek_msg_received() else {
                    continue;
                };
                if req.address == write_req.address {
                    write_port.take_msg_received();
                    self.finished_reqs[port].push_back(MemResponse {
                        address: req.address,
                        id: req.id,
                    });
                    self.read_hits += 1;
                    return;
                }
            }
            #[cfg(debug_assertions)]
            {
                debug_assert!(self.c_addrs.contains(&req.address));
                self.c_addrs.remove(&req.address);
            }
        }
        if let Some(idx) = self.cache_search(req.address) {
            if self.cache_lines[idx].c_partial {
                debug_assert!(req.address >= self.c_partials_base_addr);
                self.cache_lines[idx] = CacheLine::invalid();
                self.num_c_partial_blocks -= 1;
            } else if self.cache_lines[idx].num_uses > 0 {
                self.cache_lines[idx].num_uses -= 1;
            }
            self.finished_reqs[port].push_back(MemResponse {
                address: req.address,
                id: req.id,
            });
            self.read_hits += 1;
            return;
        }
        if let Some(pending) = self.pending_reqs.get_mut(&req.address) {
            pending.dest_ids.push((port, req.id));
            if pending.num_uses > 0 {
                pending.num_uses -= 1;
            }
            return;
        }
        let mut pending = PendingRead::default();
        pending.dest_ids.push((port, req.id));
        if req.address >= self.c_partials_base_addr {
            pending.c_partial = true;
            self.c_partial_reads += 1;
        } else {
            self.b_data_reads += 1;
        }
        self.pending_reqs.insert(req.address, pending);
        let mut address = req.address;
        for _ in 0..3 {
            let bank = self.address_to_bank(address);
            self.banks[bank].mem_reqs.push_back(MemRequest::read(address, 0));
            address += MEM_TRANSACTION_SIZE as u64;
        }
    }

    fn receive_write_requests(&mut self) {
        for i in 0..self.banks.len() {
            for _ in 0..self.write_ports.len() {
                self.banks[i].write_arbiter =
                    inc_mod(self.banks[i].write_arbiter, self.write_ports.len());
                let p = self.banks[i].write_arbiter;
                let Some(req) = self.write_ports[p].peek_msg_received() else {
                    continue;
                };
                if self.address_to_bank(req.address) != i {
                    continue;
                }
                #[cfg(debug_assertions)]
                {
                    debug_assert!(!self.c_addrs.contains(&req.address));
                    self.c_addrs.insert(req.address);
                }
                self.cache_insert(req.address, 1, true);
                self.write_ports[p].take_msg_received();
                self.writes += 1;
                break;
            }
        }
    }

    /// Walk the next `n` entries of the preprocessed B-row list and pull
    /// every block they touch that is neither resident nor already pending.
    fn receive_prefetch_data(&mut self) {
        let Some(mut prefetch_num_elements) = self.prefetch_port.take_msg_received() else {
            return;
        };
        while prefetch_num_elements > 0 {
            let (b_row_ptr, b_row_end) = self.preproc_b_row_ptr_end[self.prefetch_idx];
            self.prefetch_idx += 1;
            prefetch_num_elements -= 1;
            let mut b_row_ptr = round_down_multiple(b_row_ptr as u64, BLOCK_SIZE as u64);
            let b_row_end = round_up_multiple(b_row_end as u64, BLOCK_SIZE as u64);
            while b_row_ptr < b_row_end {
                let addr = self.b_elements_addr + b_row_ptr * ELEMENT_SIZE as u64;
                b_row_ptr += BLOCK_SIZE as u64;
                if let Some(idx) = self.cache_search(addr) {
                    self.cache_lines[idx].num_uses += 1;
                    continue;
                }
                if let Some(pending) = self.pending_reqs.get_mut(&addr) {
                    pending.num_uses += 1;
                    continue;
                }
                self.pending_reqs.insert(
                    addr,
                    PendingRead {
                        num_uses: 1,
                        ..Default::default()
                    },
                );
                let mut req_addr = addr;
                for _ in 0..3 {
                    self.prefetch_reqs.push_back(MemRequest::read(req_addr, 0));
                    req_addr += MEM_TRANSACTION_SIZE as u64;
                }
                self.b_data_reads += 1;
            }
        }
    }

    fn cache_search(&self, address: Addr) -> Option<usize> {
        let address = round_down_multiple(address, BLOCK_SIZE_BYTES as u64);
        let index =
            (address / BLOCK_SIZE_BYTES as u64) as usize % (self.cache_lines.len() / self.assoc);
        (0..self.assoc)
            .map(|i| index * self.assoc + i)
            .find(|&idx| self.cache_lines[idx].address == address)
    }

    fn cache_insert(&mut self, address: Addr, num_uses: u32, c_partial: bool) {
        let index =
            (address / BLOCK_SIZE_BYTES as u64) as usize % (self.cache_lines.len() / self.assoc);
        let mut min_num_uses = u32::MAX;
        let mut min_idx = 0;
        for i in 0..self.assoc {
            let idx = index * self.assoc + i;
            if !self.cache_lines[idx].valid() {
                self.cache_lines[idx] = CacheLine {
                    address,
                    num_uses,
                    c_partial,
                };
                if c_partial {
                    self.num_c_partial_blocks += 1;
                } else {
                    self.num_b_blocks += 1;
                }
                return;
            }
            if min_num_uses > self.cache_lines[idx].num_uses {
                min_num_uses = self.cache_lines[idx].num_uses;
                min_idx = idx;
            }
        }
        if num_uses > min_num_uses || (c_partial && min_num_uses <= 1) {
            if self.cache_lines[min_idx].c_partial {
                self.cache_evict(self.cache_lines[min_idx].address);
                if !c_partial {
                    self.num_b_blocks += 1;
                    self.num_c_partial_blocks -= 1;
                }
            } else if c_partial {
                self.num_c_partial_blocks += 1;
                self.num_b_blocks -= 1;
            }
            self.cache_lines[min_idx] = CacheLine {
                address,
                num_uses,
                c_partial,
            };
        } else if c_partial {
            // the set refused the partial: write it straight back
            self.cache_evict(address);
        }
    }

    fn cache_evict(&mut self, address: Addr) {
        let bank = self.address_to_bank(address);
        let mut address = address;
        for _ in 0..3 {
            self.banks[bank].mem_reqs.push_back(MemRequest::write(address));
            address += MEM_TRANSACTION_SIZE as u64;
        }
        self.c_partial_writes += 1;
    }

    fn address_to_bank(&self, address: Addr) -> usize {
        (address / BLOCK_SIZE_BYTES as u64) as usize % self.banks.len()
    }

    fn sample_cache_utilization(&mut self) {
        self.b_blocks_avg += self.num_b_blocks;
        self.c_partial_blocks_avg += self.num_c_partial_blocks;
        self.num_samples += 1;
    }

    /// Debug accounting over the block store.
    pub fn occupancy(&self) -> (usize, usize) {
        (self.num_b_blocks, self.num_c_partial_blocks)
    }
}
