use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use crate::base::{Addr, INVALID_ADDR, MEM_TRANSACTION_SIZE};

/// Streams a contiguous host-side array through a bounded window, one memory
/// transaction at a time.
///
/// Elements become visible in array order: a transaction's elements are
/// committed to the window only once every earlier outstanding transaction
/// has completed, regardless of memory reply order.
pub struct ArrayFetcher<T> {
    vec: Arc<Vec<T>>,
    pub buffer_size: usize,
    pub base_addr: Addr,
    pub num_elements: usize,
    idx: usize,
    idx_fetch: usize,
    pending_reqs: VecDeque<(Addr, bool)>,
}

impl<T: Copy> ArrayFetcher<T> {
    pub fn new(vec: Arc<Vec<T>>) -> Self {
        ArrayFetcher {
            vec,
            buffer_size: 0,
            base_addr: INVALID_ADDR,
            num_elements: 0,
            idx: 0,
            idx_fetch: 0,
            pending_reqs: VecDeque::new(),
        }
    }

    const fn transaction_elements() -> usize {
        MEM_TRANSACTION_SIZE / mem::size_of::<T>()
    }

    pub fn reset(&mut self, vec: Arc<Vec<T>>, base_addr: Addr) {
        self.vec = vec;
        self.base_addr = base_addr;
        self.num_elements = 0;
        self.idx = 0;
        self.idx_fetch = 0;
        self.pending_reqs.clear();
    }

    /// Next transaction address to request, or `INVALID_ADDR` when the array
    /// is exhausted or the window has no room for another transaction.
    pub fn get_fetch_address(&mut self) -> Addr {
        if self.idx_fetch >= self.vec.len() {
            return INVALID_ADDR;
        }
        if self.idx_fetch - self.idx > self.buffer_size - Self::transaction_elements() {
            return INVALID_ADDR;
        }
        let address = self.base_addr + (self.idx_fetch * mem::size_of::<T>()) as Addr;
        self.pending_reqs.push_back((address, false));
        self.idx_fetch += Self::transaction_elements();
        address
    }

    /// Complete the outstanding request at `address` and commit, in FIFO
    /// order, every leading completed transaction's worth of elements.
    /// Returns the number of elements that became visible.
    pub fn receive_data(&mut self, address: Addr) -> usize {
        if address == INVALID_ADDR {
            return 0;
        }
        debug_assert!(!self.pending_reqs.is_empty());
        for req in &mut self.pending_reqs {
            if req.0 == address {
                req.1 = true;
                break;
            }
        }
        let mut total_received = 0;
        while let Some(&(_, done)) = self.pending_reqs.front() {
            if !done {
                break;
            }
            let received =
                Self::transaction_elements().min(self.vec.len() - self.num_elements - self.idx);
            self.num_elements += received;
            total_received += received;
            debug_assert!(self.num_elements <= self.buffer_size);
            self.pending_reqs.pop_front();
        }
        total_received
    }

    pub fn finished(&self) -> bool {
        self.idx == self.vec.len()
    }

    pub fn front(&self) -> T {
        self.vec[self.idx]
    }

    pub fn at(&self, pos: usize) -> T {
        self.vec[self.idx + pos]
    }

    pub fn pop(&mut self) {
        if self.num_elements == 0 {
            return;
        }
        self.idx += 1;
        self.num_elements -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(len: usize, buffer: usize) -> ArrayFetcher<u32> {
        let vec: Vec<u32> = (0..len as u32).collect();
        let mut f = ArrayFetcher::new(Arc::new(vec));
        f.buffer_size = buffer;
        f.base_addr = 0x1000;
        f
    }

    #[test]
    fn issues_transaction_aligned_addresses() {
        let mut f = fetcher(32, 16);
        assert_eq!(f.get_fetch_address(), 0x1000);
        assert_eq!(f.get_fetch_address(), 0x1020);
        // 16-element window minus one 8-element transaction in flight.
        assert_eq!(f.get_fetch_address(), INVALID_ADDR);
    }

    #[test]
    fn fifo_commit_over_out_of_order_replies() {
        let mut f = fetcher(32, 16);
        let a0 = f.get_fetch_address();
        let a1 = f.get_fetch_address();
        // Reply to the second transaction first: nothing becomes visible.
        assert_eq!(f.receive_data(a1), 0);
        assert_eq!(f.num_elements, 0);
        // The first reply commits both.
        assert_eq!(f.receive_data(a0), 16);
        assert_eq!(f.num_elements, 16);
        assert_eq!(f.front(), 0);
        assert_eq!(f.at(9), 9);
    }

    #[test]
    fn tail_transaction_commits_partial_count() {
        let mut f = fetcher(10, 16);
        let a0 = f.get_fetch_address();
        let a1 = f.get_fetch_address();
        assert_eq!(f.get_fetch_address(), INVALID_ADDR);
        assert_eq!(f.receive_data(a0), 8);
        assert_eq!(f.receive_data(a1), 2);
        assert_eq!(f.num_elements, 10);
        for i in 0..10 {
            assert_eq!(f.front(), i);
            f.pop();
        }
        assert!(f.finished());
        assert_eq!(f.get_fetch_address(), INVALID_ADDR);
    }

    #[test]
    fn window_frees_as_elements_pop() {
        let mut f = fetcher(64, 16);
        let a0 = f.get_fetch_address();
        let a1 = f.get_fetch_address();
        f.receive_data(a0);
        f.receive_data(a1);
        assert_eq!(f.get_fetch_address(), INVALID_ADDR);
        for _ in 0..8 {
            f.pop();
        }
        assert_ne!(f.get_fetch_address(), INVALID_ADDR);
    }
}
