//! Thread-local cache of scratch blocks for the audio thread.
//!
//! Nodes frequently need a premix buffer for one block of audio. Allocating
//! per block is off the table on the audio thread, so blocks are pooled in a
//! thread-local free list and handed out through a guard that returns them on
//! drop. Blocks are `BLOCK_SIZE * MAX_CHANNELS` floats, aligned to
//! [`ALIGNMENT`], and zeroed on acquisition.

use std::cell::RefCell;

use crate::config::{ALIGNMENT, BLOCK_SIZE, MAX_CHANNELS};

const BLOCK_LEN: usize = BLOCK_SIZE * MAX_CHANNELS;

#[repr(align(16))]
struct AlignedBlock([f32; BLOCK_LEN]);

const _: () = assert!(std::mem::align_of::<AlignedBlock>() == ALIGNMENT);

// Grown lazily; steady state never allocates because every guard returns its
// block to the list on drop.
thread_local! {
    static FREE_BLOCKS: RefCell<Vec<Box<AlignedBlock>>> = RefCell::new(Vec::with_capacity(4));
}

/// Scoped ownership of one zeroed scratch block.
pub struct BlockBufferGuard {
    block: Option<Box<AlignedBlock>>,
}

impl BlockBufferGuard {
    pub fn as_slice(&self) -> &[f32] {
        &self.block.as_ref().unwrap().0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.block.as_mut().unwrap().0
    }
}

impl Drop for BlockBufferGuard {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            FREE_BLOCKS.with(|cache| cache.borrow_mut().push(block));
        }
    }
}

/// Acquires a zero-filled scratch block from the calling thread's pool.
pub fn acquire_block_buffer() -> BlockBufferGuard {
    let block = FREE_BLOCKS.with(|cache| cache.borrow_mut().pop());
    let block = match block {
        Some(mut b) => {
            b.0.fill(0.0);
            b
        }
        None => Box::new(AlignedBlock([0.0f32; BLOCK_LEN])),
    };
    BlockBufferGuard { block: Some(block) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquired_block_is_zeroed() {
        {
            let mut guard = acquire_block_buffer();
            guard.as_mut_slice()[0] = 1.0;
        }
        let guard = acquire_block_buffer();
        assert!(guard.as_slice().iter().all(|&s| s == 0.0));
        assert_eq!(guard.as_slice().len(), BLOCK_LEN);
    }

    #[test]
    fn test_blocks_are_aligned() {
        let guard = acquire_block_buffer();
        assert_eq!(guard.as_slice().as_ptr() as usize % ALIGNMENT, 0);
    }

    #[test]
    fn test_blocks_are_reused() {
        let first = {
            let guard = acquire_block_buffer();
            guard.as_slice().as_ptr() as usize
        };
        let second = {
            let guard = acquire_block_buffer();
            guard.as_slice().as_ptr() as usize
        };
        assert_eq!(first, second);
    }
}
