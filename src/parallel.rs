//! Structured parallel-for over disjoint, item-aligned chunks of a buffer.
//!
//! Work is split into at most [`MAX_WORKERS`] chunks of equal item count. Every call returns
//! only after all workers are done, so callers never observe a partially written buffer.

use rayon::prelude::*;

/// The preferred number of workers per parallel section.
pub const MAX_WORKERS: usize = 16;

/// Picks the number of workers and the number of items per worker for `items` items.
///
/// Prefers 16 workers and falls back to 8, 4, 2 or a single worker, so that every worker gets
/// the same whole number of items.
pub fn pick_num_workers(items: usize) -> (usize, usize) {
    if items == 0 {
        return (1, 0);
    }
    for workers in [MAX_WORKERS, 8, 4, 2] {
        if items % workers == 0 {
            return (workers, items / workers);
        }
    }
    (1, items)
}

/// Runs `f` on each worker chunk of `buf`, where an item is `item_len` bytes long.
///
/// `f` receives the index of the first item in its chunk and the chunk itself.
pub fn for_each_chunk_mut<F>(buf: &mut [u8], item_len: usize, f: F)
where
    F: Fn(usize, &mut [u8]) + Send + Sync,
{
    if buf.is_empty() || item_len == 0 {
        return;
    }
    let (_, chunk_items) = pick_num_workers(buf.len() / item_len);
    buf.par_chunks_mut(chunk_items * item_len)
        .enumerate()
        .for_each(|(i, chunk)| f(i * chunk_items, chunk));
}

/// Maps each worker's range of `items` to a value, returned in worker order.
pub fn map_ranges<T, F>(items: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(std::ops::Range<usize>) -> T + Send + Sync,
{
    let (workers, chunk_items) = pick_num_workers(items);
    (0..workers)
        .into_par_iter()
        .map(|w| f(w * chunk_items..(w + 1) * chunk_items))
        .collect()
}
