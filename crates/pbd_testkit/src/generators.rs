//! Property-based test generators using proptest.
//!
//! Provides strategies for generating payloads and id sequences that keep
//! the deque's ordering rules.

use proptest::prelude::*;
use rand::Rng;

/// Strategy for generating payloads (arbitrary bytes).
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for payloads that compress well.
pub fn repetitive_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    (any::<u8>(), 64usize..2048).prop_map(|(byte, len)| vec![byte; len])
}

/// Strategy for a batch of payloads.
pub fn payload_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(payload_strategy(), 1..max)
}

/// One id range of a generated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdStep {
    /// First id.
    pub start: i64,
    /// Last id.
    pub end: i64,
    /// The range does not follow its predecessor directly.
    ///
    /// The deque accepts such a range only as the first entry of a new
    /// segment, so callers roll the segment before offering it.
    pub jump: bool,
}

/// Strategy for a strictly increasing sequence of id ranges.
///
/// Each range starts right after the previous one ends, except for an
/// occasional forward jump.
pub fn id_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<IdStep>> {
    (
        0i64..1_000,
        prop::collection::vec((0i64..8, prop::bool::weighted(0.2), 1i64..50), 1..max_len),
    )
        .prop_map(|(first, steps)| {
            let mut next = first;
            steps
                .into_iter()
                .enumerate()
                .map(|(i, (width, jump, gap))| {
                    let jump = jump && i > 0;
                    if jump {
                        next += gap;
                    }
                    let step = IdStep {
                        start: next,
                        end: next + width,
                        jump,
                    };
                    next += width + 1;
                    step
                })
                .collect()
        })
}

/// Strategy for payloads paired with their id ranges.
pub fn tracked_entries_strategy(max_len: usize) -> impl Strategy<Value = Vec<(Vec<u8>, IdStep)>> {
    id_sequence_strategy(max_len).prop_flat_map(|ids| {
        let len = ids.len();
        prop::collection::vec(payload_strategy(), len)
            .prop_map(move |payloads| payloads.into_iter().zip(ids.clone()).collect())
    })
}

/// Fills a buffer of random length in `min..=max` with random bytes.
pub fn random_buffer(rng: &mut impl Rng, min: usize, max: usize) -> Vec<u8> {
    let len = rng.gen_range(min..=max);
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn id_sequences_increase(ids in id_sequence_strategy(32)) {
            prop_assert!(!ids[0].jump);
            for pair in ids.windows(2) {
                prop_assert!(pair[0].start <= pair[0].end);
                prop_assert_eq!(pair[1].start == pair[0].end + 1, !pair[1].jump);
            }
        }

        #[test]
        fn tracked_entries_align(entries in tracked_entries_strategy(16)) {
            prop_assert!(!entries.is_empty());
        }
    }

    #[test]
    fn random_buffer_respects_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let buf = random_buffer(&mut rng, 10, 20);
            assert!((10..=20).contains(&buf.len()));
        }
    }
}
