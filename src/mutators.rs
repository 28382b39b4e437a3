//! Various methods used to mutate inputs

use rand::rngs::StdRng;
use rand::Rng;

/// Values worth planting whole because they sit on overflow and sign
/// boundaries
const INTERESTING_U32: [u32; 8] = [
    0,
    1,
    0x7f,
    0x80,
    0xff,
    0x7fff_ffff,
    0x8000_0000,
    0xffff_ffff,
];

/// Flip a random bit in the input
pub fn bit_flip(input: &mut Vec<u8>, rng: &mut StdRng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let byte_offset = rng.gen_range(0..input.len());
    let bit_offset = rng.gen_range(0..8u32);

    input[byte_offset] ^= 1 << bit_offset;

    Some(format!(
        "BitFlip_offset_{byte_offset:#x}_bit_{bit_offset:#x}"
    ))
}

/// Replace a random byte in the input with a new byte
pub fn byte_replace(input: &mut Vec<u8>, rng: &mut StdRng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.gen_range(0..input.len());
    let rand_byte: u8 = rng.gen();

    input[offset] = rand_byte;

    Some(format!("ByteReplace_offset_{offset:#x}_byte_{rand_byte:#x}"))
}

/// Insert a random byte into the input
pub fn byte_insert(input: &mut Vec<u8>, rng: &mut StdRng) -> Option<String> {
    let offset = if input.is_empty() {
        0
    } else {
        rng.gen_range(0..=input.len())
    };
    let rand_byte: u8 = rng.gen();

    input.insert(offset, rand_byte);

    Some(format!("ByteInsert_offset_{offset:#x}_byte_{rand_byte:#x}"))
}

/// Delete a random byte from the input
pub fn byte_delete(input: &mut Vec<u8>, rng: &mut StdRng) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let offset = rng.gen_range(0..input.len());
    input.remove(offset);

    Some(format!("ByteDelete_offset_{offset:#x}"))
}

/// Overwrite a random aligned dword with an interesting value
pub fn dword_replace(input: &mut Vec<u8>, rng: &mut StdRng) -> Option<String> {
    if input.len() < 4 {
        return None;
    }

    let offset = rng.gen_range(0..=input.len() - 4);
    let value = INTERESTING_U32[rng.gen_range(0..INTERESTING_U32.len())];

    input[offset..offset + 4].copy_from_slice(&value.to_le_bytes());

    Some(format!("DwordReplace_offset_{offset:#x}_val_{value:#x}"))
}

/// Copy a random slice from another corpus input over a random offset
pub fn splice(input: &mut Vec<u8>, corpus: &[Vec<u8>], rng: &mut StdRng) -> Option<String> {
    if input.is_empty() || corpus.is_empty() {
        return None;
    }

    let donor = &corpus[rng.gen_range(0..corpus.len())];
    if donor.is_empty() {
        return None;
    }

    let src = rng.gen_range(0..donor.len());
    let dst = rng.gen_range(0..input.len());
    let len = rng
        .gen_range(1..=donor.len() - src)
        .min(input.len() - dst);

    input[dst..dst + len].copy_from_slice(&donor[src..src + len]);

    Some(format!("Splice_src_{src:#x}_dst_{dst:#x}_len_{len:#x}"))
}

/// Apply a handful of random mutations to `input`, bounded by `max_size`.
/// Returns the labels of the mutations that actually applied.
pub fn mutate_input(
    input: &mut Vec<u8>,
    corpus: &[Vec<u8>],
    rng: &mut StdRng,
    max_size: usize,
) -> Vec<String> {
    let count = rng.gen_range(1..=4);
    let mut applied = Vec::with_capacity(count);

    for _ in 0..count {
        let label = match rng.gen_range(0..6u32) {
            0 => bit_flip(input, rng),
            1 => byte_replace(input, rng),
            2 => byte_insert(input, rng),
            3 => byte_delete(input, rng),
            4 => dword_replace(input, rng),
            _ => splice(input, corpus, rng),
        };

        if let Some(label) = label {
            applied.push(label);
        }
    }

    input.truncate(max_size);
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn bit_flip_changes_exactly_one_bit() {
        let mut rng = StdRng::seed_from_u64(0x1337);
        let original = vec![0u8; 32];
        let mut input = original.clone();

        bit_flip(&mut input, &mut rng).unwrap();

        let differing_bits: u32 = original
            .iter()
            .zip(&input)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum();
        assert_eq!(differing_bits, 1);
    }

    #[test]
    fn empty_input_mutators_are_noops() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut input = Vec::new();

        assert!(bit_flip(&mut input, &mut rng).is_none());
        assert!(byte_replace(&mut input, &mut rng).is_none());
        assert!(byte_delete(&mut input, &mut rng).is_none());
        assert!(dword_replace(&mut input, &mut rng).is_none());

        // Insert still works on an empty input
        assert!(byte_insert(&mut input, &mut rng).is_some());
        assert_eq!(input.len(), 1);
    }

    #[test]
    fn mutate_input_respects_max_size() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut input = vec![0xab; 16];

        for _ in 0..100 {
            mutate_input(&mut input, &[], &mut rng, 16);
            assert!(input.len() <= 16);
        }
    }

    #[test]
    fn same_seed_same_mutations() {
        let corpus = vec![vec![0x11; 8], vec![0x22; 24]];

        let mut a = vec![0u8; 32];
        let mut b = a.clone();

        let labels_a = mutate_input(&mut a, &corpus, &mut StdRng::seed_from_u64(42), 64);
        let labels_b = mutate_input(&mut b, &corpus, &mut StdRng::seed_from_u64(42), 64);

        assert_eq!(a, b);
        assert_eq!(labels_a, labels_b);
    }
}
