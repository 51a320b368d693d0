//! Cryptographic utilities for mining
//!
//! SHA-256d over 80-byte headers, midstate precomputation and target checks.
//!
//! Header material is kept in getwork word order: every 4-byte word is stored
//! little-endian, while the hash input wants the words big-endian. The nonce
//! handed around by kernels is the value of the last word of the hash input.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use sha2::digest::consts::U64;
use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

use crate::types::{HEADER_SIZE, NONCE_OFFSET};

/// SHA-256 initial hash value
pub const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab,
    0x5be0cd19,
];

/// Check a hash against a target, both 256-bit little-endian
///
/// Bytes are compared from the most significant (last stored) down; the first
/// difference decides. A hash equal to the target meets it.
pub fn check_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for (t, h) in target.iter().rev().zip(hash.iter().rev()) {
        if t > h {
            return true;
        } else if t < h {
            return false;
        }
    }
    true
}

/// Build the 80-byte hash input for a header and nonce
pub fn hash_input(data: &[u8; HEADER_SIZE], nonce: u32) -> [u8; HEADER_SIZE] {
    let mut input = [0u8; HEADER_SIZE];
    for (src, dst) in data[..NONCE_OFFSET]
        .chunks_exact(4)
        .zip(input[..NONCE_OFFSET].chunks_exact_mut(4))
    {
        BigEndian::write_u32(dst, LittleEndian::read_u32(src));
    }
    BigEndian::write_u32(&mut input[NONCE_OFFSET..], nonce);
    input
}

/// SHA-256d of a header with the given nonce
pub fn calculate_hash(data: &[u8; HEADER_SIZE], nonce: u32) -> [u8; 32] {
    let first = Sha256::digest(hash_input(data, nonce));
    Sha256::digest(first).into()
}

/// The header with the nonce written into its slot, as submitted upstream
pub fn format_solution(data: &[u8; HEADER_SIZE], nonce: u32) -> [u8; HEADER_SIZE] {
    let mut solution = *data;
    LittleEndian::write_u32(&mut solution[NONCE_OFFSET..], nonce);
    solution
}

fn compress(state: &mut [u32; 8], block: &[u8]) {
    let block: GenericArray<u8, U64> = GenericArray::clone_from_slice(block);
    sha2::compress256(state, &[block]);
}

/// SHA-256 state after the first 64 bytes of the hash input, packed little-endian
pub fn calculate_midstate(data: &[u8; HEADER_SIZE]) -> [u8; 32] {
    let input = hash_input(data, 0);
    let mut state = SHA256_IV;
    compress(&mut state, &input[..64]);

    let mut midstate = [0u8; 32];
    LittleEndian::write_u32_into(&state, &mut midstate);
    midstate
}

/// Unpack a midstate into SHA-256 state words
pub fn midstate_words(midstate: &[u8; 32]) -> [u32; 8] {
    let mut words = [0u32; 8];
    LittleEndian::read_u32_into(midstate, &mut words);
    words
}

/// Finish SHA-256d from a midstate and the last 16 bytes of the hash input
pub fn hash_from_midstate(midstate: &[u32; 8], tail: &[u8; 16]) -> [u8; 32] {
    let mut block = [0u8; 64];
    block[..16].copy_from_slice(tail);
    block[16] = 0x80;
    BigEndian::write_u64(&mut block[56..], (HEADER_SIZE * 8) as u64);

    let mut state = *midstate;
    compress(&mut state, &block);

    let mut second = [0u8; 64];
    BigEndian::write_u32_into(&state, &mut second[..32]);
    second[32] = 0x80;
    BigEndian::write_u64(&mut second[56..], 256);

    let mut state = SHA256_IV;
    compress(&mut state, &second);

    let mut digest = [0u8; 32];
    BigEndian::write_u32_into(&state, &mut digest);
    digest
}
