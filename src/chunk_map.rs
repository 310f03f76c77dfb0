//! File-wide chunk completion and its compact wire form.
//!
//! On the wire a chunk map is a sequence of little-endian 32-bit words, bit 0
//! of word 0 being chunk 0. The bit length may exceed the real chunk count;
//! consumers reconcile it against the file size.

use crate::block::CHUNK_SIZE;
use bitvec::prelude::*;

pub type ChunkMap = BitVec<u32, Lsb0>;

/// Number of chunks of a file of `file_size` bytes.
pub fn chunk_count(file_size: u64) -> usize {
    file_size.div_ceil(CHUNK_SIZE) as usize
}

/// Byte length of chunk `index`, shorter for the last chunk.
pub fn chunk_len(file_size: u64, index: u32) -> u64 {
    let start = index as u64 * CHUNK_SIZE;
    file_size.saturating_sub(start).min(CHUNK_SIZE)
}

pub fn empty(n_chunks: usize) -> ChunkMap {
    BitVec::repeat(false, n_chunks)
}

pub fn full(n_chunks: usize) -> ChunkMap {
    BitVec::repeat(true, n_chunks)
}

/// Sizes a received or restored map to exactly `n_chunks`, dropping padding bits.
pub fn fit(mut map: ChunkMap, n_chunks: usize) -> ChunkMap {
    map.resize(n_chunks, false);
    map
}

pub fn has(map: &ChunkMap, index: usize) -> bool {
    map.get(index).map_or(false, |bit| *bit)
}

/// Packs a chunk map into 32-bit words, zero-padding the last word.
pub fn encode(map: &ChunkMap) -> Vec<u32> {
    let mut words = vec![0u32; map.len().div_ceil(32)];
    for index in map.iter_ones() {
        words[index / 32] |= 1 << (index % 32);
    }
    words
}

/// Expands words into a map of `words.len() * 32` bits.
pub fn decode(words: &[u32]) -> ChunkMap {
    BitVec::from_vec(words.to_vec())
}

pub fn encode_bytes(map: &ChunkMap) -> Vec<u8> {
    encode(map).iter().flat_map(|word| word.to_le_bytes()).collect()
}

/// Trailing bytes that do not make a whole word are ignored.
pub fn decode_bytes(bytes: &[u8]) -> ChunkMap {
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect();
    decode(&words)
}
