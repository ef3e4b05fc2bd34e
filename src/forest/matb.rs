use std::collections::VecDeque;

use crate::base::math::inc_mod;
use crate::base::{
    Addr, BLOCK_SIZE, BLOCK_SIZE_BYTES, ELEMENT_SIZE, INVALID_ADDR, INVALID_IDX,
    MEM_TRANSACTION_SIZE,
};
use crate::sim::mem::{MemRequest, MemResponse};

/// Streams one B row from memory in transaction-sized pieces, accumulating
/// bytes until a full cache block (or the row's tail) is ready.
#[derive(Debug, Default, Clone)]
pub struct RowFetcher {
    pub row_ptr_addr: Addr,
    pub row_end_addr: Addr,
    /// Cache block index the next ready block belongs to.
    pub row_ptr: u32,
    pub num_bytes_received: usize,
    pub pending_reqs: VecDeque<(Addr, bool)>,
}

impl RowFetcher {
    pub fn new() -> Self {
        RowFetcher {
            row_ptr_addr: INVALID_ADDR,
            row_end_addr: INVALID_ADDR,
            row_ptr: INVALID_IDX,
            num_bytes_received: 0,
            pending_reqs: VecDeque::new(),
        }
    }

    /// `(num_elements, block_ptr, last)` for the next ready block, or
    /// `(0, _, false)` if nothing is complete yet.
    pub fn get_data(&mut self) -> (u32, u32, bool) {
        if self.row_ptr_addr == INVALID_ADDR {
            return (0, INVALID_IDX, false);
        }
        let last = self.row_ptr_addr == self.row_end_addr
            && self.pending_reqs.is_empty()
            && self.num_bytes_received <= BLOCK_SIZE_BYTES;
        if last {
            let num_elements = (self.num_bytes_received / ELEMENT_SIZE) as u32;
            self.row_ptr_addr = INVALID_ADDR;
            self.row_end_addr = INVALID_ADDR;
            self.num_bytes_received = 0;
            (num_elements, self.row_ptr, true)
        } else if self.num_bytes_received >= BLOCK_SIZE_BYTES {
            self.num_bytes_received -= BLOCK_SIZE_BYTES;
            (BLOCK_SIZE as u32, self.row_ptr, false)
        } else {
            (0, INVALID_IDX, false)
        }
    }
}

/// Round-robin pool of row fetchers with a shared outstanding-request cap.
#[derive(Default)]
pub struct MatBFetcher {
    pub row_fetchers: Vec<RowFetcher>,
    new_row_idx: usize,
    request_idx: usize,
    pub num_outstanding_reqs: usize,
    pub num_rows_fetch: usize,
    pub max_outstanding_reqs: usize,
    // stats
    pub bytes_read_b_data: usize,
}

impl MatBFetcher {
    pub fn new(max_rows: usize, max_outstanding_reqs: usize) -> Self {
        MatBFetcher {
            row_fetchers: vec![RowFetcher::new(); max_rows],
            new_row_idx: 0,
            request_idx: 0,
            num_outstanding_reqs: 0,
            num_rows_fetch: 0,
            max_outstanding_reqs,
            bytes_read_b_data: 0,
        }
    }

    pub fn reset(&mut self) {
        for fetcher in &mut self.row_fetchers {
            *fetcher = RowFetcher::new();
        }
        self.new_row_idx = 0;
        self.request_idx = 0;
        self.num_outstanding_reqs = 0;
        self.num_rows_fetch = 0;
        self.bytes_read_b_data = 0;
    }

    pub fn can_accept_row(&self) -> bool {
        self.num_rows_fetch < self.row_fetchers.len()
    }

    /// Claim a free row fetcher for the byte range `[begin, end)`, tagged
    /// with the cache block the row head was assigned.
    pub fn add_row(&mut self, begin: Addr, end: Addr, row_ptr_cache: u32) -> bool {
        if !self.can_accept_row() {
            return false;
        }
        for _ in 0..self.row_fetchers.len() {
            self.new_row_idx = inc_mod(self.new_row_idx, self.row_fetchers.len());
            let fetcher = &mut self.row_fetchers[self.new_row_idx];
            if fetcher.row_ptr_addr == INVALID_ADDR {
                fetcher.row_ptr = row_ptr_cache;
                fetcher.row_ptr_addr = begin;
                fetcher.row_end_addr = end;
                self.num_rows_fetch += 1;
                return true;
            }
        }
        unreachable!("num_rows_fetch undercounted");
    }

    /// One transaction-aligned read request, round-robin over active rows.
    pub fn get_request(&mut self) -> MemRequest {
        if self.num_outstanding_reqs == self.max_outstanding_reqs {
            return MemRequest::default();
        }
        for _ in 0..self.row_fetchers.len() {
            self.request_idx = inc_mod(self.request_idx, self.row_fetchers.len());
            let fetcher = &mut self.row_fetchers[self.request_idx];
            if fetcher.row_ptr_addr < fetcher.row_end_addr {
                let request = MemRequest::read(fetcher.row_ptr_addr, self.request_idx as u32);
                fetcher.pending_reqs.push_back((fetcher.row_ptr_addr, false));
                let num_bytes = (MEM_TRANSACTION_SIZE as u64
                    - fetcher.row_ptr_addr % MEM_TRANSACTION_SIZE as u64)
                    .min(fetcher.row_end_addr - fetcher.row_ptr_addr);
                fetcher.row_ptr_addr += num_bytes;
                self.num_outstanding_reqs += 1;
                self.bytes_read_b_data += num_bytes as usize;
                return request;
            }
        }
        MemRequest::default()
    }

    /// Byte counts commit in FIFO order within each row.
    pub fn put_response(&mut self, response: &MemResponse) -> bool {
        let fetcher = &mut self.row_fetchers[response.id as usize];
        debug_assert!(!fetcher.pending_reqs.is_empty());
        for req in &mut fetcher.pending_reqs {
            if req.0 == response.address {
                req.1 = true;
                break;
            }
        }
        while let Some(&(address, done)) = fetcher.pending_reqs.front() {
            if !done {
                break;
            }
            fetcher.num_bytes_received += ((MEM_TRANSACTION_SIZE as u64
                - address % MEM_TRANSACTION_SIZE as u64)
                .min(fetcher.row_end_addr - address)) as usize;
            fetcher.pending_reqs.pop_front();
        }
        self.num_outstanding_reqs -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_streams_in_blocks_then_tail() {
        let mut fetcher = MatBFetcher::new(2, 16);
        // 10 elements = 120 bytes starting at 0
        assert!(fetcher.add_row(0, 120, 7));
        let mut issued = Vec::new();
        loop {
            let req = fetcher.get_request();
            if !req.valid() {
                break;
            }
            issued.push(req);
        }
        // 120 bytes = 4 transactions of 32/32/32/24
        assert_eq!(issued.len(), 4);
        assert_eq!(fetcher.bytes_read_b_data, 120);
        for req in &issued {
            fetcher.put_response(&MemResponse {
                address: req.address,
                id: req.id,
            });
        }
        let fr = &mut fetcher.row_fetchers[issued[0].id as usize];
        assert_eq!(fr.get_data(), (8, 7, false));
        // tail: 2 elements, marks last
        assert_eq!(fr.get_data(), (2, 7, true));
        assert_eq!(fr.get_data(), (0, INVALID_IDX, false));
    }

    #[test]
    fn unaligned_row_counts_partial_transactions() {
        let mut fetcher = MatBFetcher::new(1, 16);
        // starts mid-transaction: 20 bytes at address 12
        assert!(fetcher.add_row(12, 32, 0));
        let req = fetcher.get_request();
        assert_eq!(req.address, 12);
        assert!(!fetcher.get_request().valid());
        assert_eq!(fetcher.bytes_read_b_data, 20);
    }

    #[test]
    fn outstanding_request_cap() {
        let mut fetcher = MatBFetcher::new(1, 2);
        fetcher.add_row(0, 1024, 0);
        assert!(fetcher.get_request().valid());
        assert!(fetcher.get_request().valid());
        assert!(!fetcher.get_request().valid());
    }

    #[test]
    fn fifo_commit_within_row() {
        let mut fetcher = MatBFetcher::new(1, 16);
        fetcher.add_row(0, 96, 3);
        let r0 = fetcher.get_request();
        let r1 = fetcher.get_request();
        let r2 = fetcher.get_request();
        // completing the middle transaction alone commits nothing
        fetcher.put_response(&MemResponse {
            address: r1.address,
            id: r1.id,
        });
        assert_eq!(fetcher.row_fetchers[0].num_bytes_received, 0);
        fetcher.put_response(&MemResponse {
            address: r0.address,
            id: r0.id,
        });
        assert_eq!(fetcher.row_fetchers[0].num_bytes_received, 64);
        fetcher.put_response(&MemResponse {
            address: r2.address,
            id: r2.id,
        });
        assert_eq!(fetcher.row_fetchers[0].get_data(), (8, 3, true));
    }
}
