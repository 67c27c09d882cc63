use proptest::prelude::*;

use container_attach::{DetachKeys, EscapeDetector};

const SEQUENCE: [u8; 2] = [0x10, 0x11];

// Bytes drawn mostly from the detach keys so partial matches are common.
fn arb_byte() -> impl Strategy<Value = u8> {
    prop_oneof![
        3 => Just(0x10u8),
        2 => Just(0x11u8),
        5 => any::<u8>(),
    ]
}

fn arb_input() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(arb_byte(), 0..256)
}

fn arb_chunk_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1..16usize, 1..32)
}

fn first_sequence(data: &[u8]) -> Option<usize> {
    data.windows(SEQUENCE.len()).position(|w| w == SEQUENCE)
}

/// Feed `data` in chunks of the given sizes (cycled), then finish.
fn run(data: &[u8], sizes: &[usize]) -> (Vec<u8>, bool) {
    let mut detector = EscapeDetector::new(DetachKeys::default());
    let mut out = Vec::new();
    let mut detached = false;
    let mut rest = data;
    for size in sizes.iter().cycle() {
        if rest.is_empty() || detached {
            break;
        }
        let (chunk, tail) = rest.split_at((*size).min(rest.len()));
        detached = detector.feed(chunk, &mut out).is_some();
        rest = tail;
    }
    detector.finish(&mut out);
    (out, detached)
}

proptest! {
    #[test]
    fn output_is_input_up_to_first_sequence(data in arb_input(), sizes in arb_chunk_sizes()) {
        let (out, detached) = run(&data, &sizes);
        match first_sequence(&data) {
            Some(at) => {
                prop_assert!(detached);
                prop_assert_eq!(out, data[..at].to_vec());
            }
            None => {
                prop_assert!(!detached);
                prop_assert_eq!(out, data);
            }
        }
    }

    #[test]
    fn chunking_never_changes_the_result(data in arb_input(), sizes in arb_chunk_sizes()) {
        let whole = run(&data, &[usize::MAX]);
        let chunked = run(&data, &sizes);
        prop_assert_eq!(whole, chunked);
    }

    #[test]
    fn bytes_without_the_first_key_pass_straight_through(
        data in prop::collection::vec(any::<u8>().prop_filter("not ctrl-p", |b| *b != 0x10), 0..256),
    ) {
        let mut detector = EscapeDetector::default();
        let mut out = Vec::new();
        prop_assert!(detector.feed(&data, &mut out).is_none());
        // Nothing is held back, so output is complete before `finish`.
        prop_assert_eq!(out, data);
    }
}
