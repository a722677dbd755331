//! Property-based round-trip and canonicalisation tests

use kdpack::{assemble, disassemble, Axis, Node, PageBits};
use proptest::prelude::*;

fn leaf_strategy() -> impl Strategy<Value = Node> {
    prop::collection::vec(any::<u16>(), 0..24).prop_map(|words| {
        let mut node = Node::new();
        node.set_leaves(words).unwrap();
        node
    })
}

fn distance_strategy(distance_length: usize) -> BoxedStrategy<Vec<u16>> {
    if distance_length == 1 {
        // 12-bit immediate: low four bits clear, below the max.
        (0u16..0x0ffe).prop_map(|v| vec![v << 4]).boxed()
    } else {
        (
            0u16..=0x001f,
            prop::collection::vec(any::<u16>(), distance_length - 1),
        )
            .prop_map(|(prefix, tail)| {
                let mut words = vec![prefix];
                words.extend(tail);
                words
            })
            .boxed()
    }
}

fn tree_strategy(distance_length: usize) -> impl Strategy<Value = Node> {
    leaf_strategy().prop_recursive(6, 48, 2, move |inner| {
        (
            distance_strategy(distance_length),
            0u16..3,
            prop::option::of(inner.clone()),
            prop::option::of(inner),
        )
            .prop_map(|(distance, raw_axis, less, greater)| {
                let axis = Axis::from_raw(raw_axis).unwrap();
                let mut node = Node::new();
                node.set_cut(&distance, axis, less, greater).unwrap();
                node
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn round_trip_preserves_the_tree(
        mut root in tree_strategy(1),
        page_bits in prop::sample::select(&[PageBits::Page32B, PageBits::Page64B, PageBits::Page128B][..]),
    ) {
        let image = assemble(&mut root, page_bits);
        prop_assert_eq!(image.len() % page_bits.page_words(), 0);

        // assemble canonicalised `root` in place, so it is the reference.
        let decoded = disassemble(&image).expect("valid image");
        prop_assert!(decoded.equals(&root, true));
    }

    #[test]
    fn round_trip_preserves_multi_word_distances(mut root in tree_strategy(3)) {
        let image = assemble(&mut root, PageBits::Page64B);
        let decoded = disassemble(&image).expect("valid image");
        prop_assert!(decoded.equals(&root, true));
    }

    #[test]
    fn trim_empty_is_idempotent(mut root in tree_strategy(1)) {
        let first = root.trim_empty();
        let second = root.trim_empty();
        prop_assert_eq!(first, second);

        let mut clone = root.clone();
        let third = clone.trim_empty();
        prop_assert_eq!(second, third);
        prop_assert!(clone.equals(&root, true));
    }

    #[test]
    fn equality_is_reflexive_and_symmetric(
        a in tree_strategy(1),
        b in tree_strategy(1),
    ) {
        prop_assert!(a.equals(&a, true));
        prop_assert!(b.equals(&b, true));
        prop_assert_eq!(a.equals(&b, true), b.equals(&a, true));
    }

    #[test]
    fn reassembly_round_trips(mut root in tree_strategy(2)) {
        let image = assemble(&mut root, PageBits::Page32B);
        let mut decoded = disassemble(&image).expect("valid image");
        let reassembled = assemble(&mut decoded, PageBits::Page128B);
        let decoded_again = disassemble(&reassembled).expect("valid image");
        prop_assert!(decoded_again.equals(&root, true));
    }
}
