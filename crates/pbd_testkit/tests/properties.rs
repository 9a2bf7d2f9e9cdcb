//! Property tests over generated payloads and id sequences.

use pbd_core::{DequeConfig, IdRange};
use pbd_testkit::prelude::*;
use proptest::prelude::*;

fn offer_steps(test_deque: &TestDeque, entries: &[(Vec<u8>, IdStep)]) {
    for (payload, step) in entries {
        if step.jump {
            test_deque.update_extra_header(Vec::<u8>::new()).unwrap();
        }
        test_deque
            .offer_with_ids(payload, step.start, step.end)
            .unwrap();
    }
}

fn read_ranges(test_deque: &TestDeque) -> Vec<(Vec<u8>, IdRange)> {
    let cursor = test_deque.open_for_read("prop", true).unwrap();
    let mut out = Vec::new();
    while let Some(entry) = cursor.poll().unwrap() {
        out.push((entry.payload().to_vec(), entry.ids().unwrap()));
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn payloads_survive_reopen(payloads in payload_batch_strategy(40)) {
        let test_deque = TestDeque::small_segments(4096);
        for payload in &payloads {
            test_deque.offer(payload).unwrap();
        }
        let test_deque = test_deque.reopen();
        prop_assert_eq!(drain(&test_deque, "r", true), payloads);
    }

    #[test]
    fn compressed_payloads_read_back(payloads in prop::collection::vec(repetitive_payload_strategy(), 1..10)) {
        let test_deque = TestDeque::with_config(DequeConfig::default().compression(true));
        for payload in &payloads {
            test_deque.offer(payload).unwrap();
        }
        prop_assert_eq!(drain(&test_deque, "r", true), payloads);
    }

    #[test]
    fn ids_read_back_monotonic(entries in tracked_entries_strategy(40)) {
        let test_deque = TestDeque::small_segments(2048);
        offer_steps(&test_deque, &entries);

        let read = read_ranges(&test_deque);
        prop_assert_eq!(read.len(), entries.len());
        for ((payload, range), (expected, step)) in read.iter().zip(&entries) {
            prop_assert_eq!(payload, expected);
            prop_assert_eq!((range.start, range.end), (step.start, step.end));
        }
        for pair in read.windows(2) {
            prop_assert!(pair[1].1.start > pair[0].1.end);
        }
    }

    #[test]
    fn overlapping_offer_never_lands(entries in tracked_entries_strategy(20), back in 0i64..5) {
        let test_deque = TestDeque::new();
        offer_steps(&test_deque, &entries);
        let last = entries.last().unwrap().1;
        let start = (last.end - back).max(0);
        prop_assert!(test_deque.offer_with_ids(b"late", start, last.end + 1).is_err());
        prop_assert_eq!(read_ranges(&test_deque).len(), entries.len());
    }

    #[test]
    fn segment_ranges_cover_their_entries(entries in tracked_entries_strategy(40)) {
        let test_deque = TestDeque::small_segments(1024);
        offer_steps(&test_deque, &entries);
        let segments = test_deque.segments();
        for pair in segments.windows(2) {
            if let (Some(a), Some(b)) = (pair[0].ids, pair[1].ids) {
                prop_assert!(a.end < b.start);
            }
        }
        let first = entries.first().unwrap().1.start;
        let last = entries.last().unwrap().1.end;
        let covered = segments.iter().filter_map(|s| s.ids).reduce(IdRange::span).unwrap();
        prop_assert_eq!((covered.start, covered.end), (first, last));
    }
}
