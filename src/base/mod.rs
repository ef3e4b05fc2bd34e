pub mod fetcher;
pub mod math;
pub mod port;

/// Physical byte address in the simulated memory space.
pub type Addr = u64;

pub const INVALID_ADDR: Addr = u64::MAX;
pub const INVALID_IDX: u32 = u32::MAX;

/// Size of one main-memory transaction in bytes.
pub const MEM_TRANSACTION_SIZE: usize = 32;
/// Size of one matrix element in bytes (4 B column index + 8 B value).
pub const ELEMENT_SIZE: usize = 12;
/// Number of elements in one cache block.
pub const BLOCK_SIZE: usize = 8;
/// Size of one cache block in bytes. A block is 3 memory transactions.
pub const BLOCK_SIZE_BYTES: usize = ELEMENT_SIZE * BLOCK_SIZE;
