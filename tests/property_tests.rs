// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Property-based tests for splitting, partitioning and check-block sizing

use proptest::prelude::*;
use splitfile_insert::bucket::{partition, split_into_blocks};
use splitfile_insert::{BlockKey, CHK_BLOCK_SIZE, FieldSet, SplitfileAlgorithm};

/// Generate a segment size, including the "segmentation disabled" sentinel
fn segment_size_strategy() -> impl Strategy<Value = i32> {
    prop_oneof![Just(-1), 1i32..=300]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn partition_covers_every_block_once(
        count in 0usize..=2000,
        segment_size in segment_size_strategy(),
    ) {
        let ranges = partition(count, segment_size);

        // Contiguous, in order, and complete
        let mut next = 0;
        for range in &ranges {
            prop_assert_eq!(range.start, next);
            next = range.end;
        }
        prop_assert_eq!(next, count);
    }

    #[test]
    fn partition_segment_count(
        count in 0usize..=2000,
        segment_size in segment_size_strategy(),
    ) {
        let ranges = partition(count, segment_size);

        if segment_size < 0 || count < segment_size as usize {
            prop_assert_eq!(ranges.len(), 1);
        } else {
            let size = segment_size as usize;
            prop_assert_eq!(ranges.len(), count.div_ceil(size));
            // Only the last window may be short
            for range in &ranges[..ranges.len() - 1] {
                prop_assert_eq!(range.len(), size);
            }
            prop_assert!(ranges[ranges.len() - 1].len() <= size);
        }
    }

    #[test]
    fn check_blocks_bounded_by_target(
        data_blocks in 0usize..=500,
        segment_size in segment_size_strategy(),
        check_segment_size in 1i32..=256,
    ) {
        let onion = SplitfileAlgorithm::OnionStandard
            .check_blocks_for(data_blocks, segment_size, check_segment_size);
        if data_blocks == 0 {
            prop_assert_eq!(onion, 0);
        } else {
            prop_assert!(onion >= 1);
            prop_assert!(onion <= check_segment_size as usize);
        }

        let none = SplitfileAlgorithm::NonRedundant
            .check_blocks_for(data_blocks, segment_size, check_segment_size);
        prop_assert_eq!(none, 0);
    }

    #[test]
    fn fieldset_text_survives_reparse(
        entries in prop::collection::btree_map("[A-Za-z][A-Za-z0-9]{0,6}", "[^\n\r]{0,20}", 0..20),
    ) {
        let mut fs = FieldSet::new();
        for (key, value) in &entries {
            fs.put_single(&format!("Nested.{}", key), value.as_str());
        }
        let parsed = FieldSet::from_text(&fs.to_text()).unwrap();
        prop_assert_eq!(parsed, fs);
    }

    #[test]
    fn block_key_text_form(routing in any::<[u8; 32]>(), crypto in any::<[u8; 32]>()) {
        let key = BlockKey::new(routing, crypto);
        let parsed: BlockKey = key.to_string().parse().unwrap();
        prop_assert_eq!(parsed, key);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn data_block_count_matches_length(len in 0usize..=(6 * CHK_BLOCK_SIZE)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let data = vec![0x5Au8; len];
        let (blocks, total) = runtime
            .block_on(split_into_blocks(&data[..], CHK_BLOCK_SIZE))
            .unwrap();

        prop_assert_eq!(total, len as u64);
        prop_assert_eq!(blocks.len(), len.div_ceil(CHK_BLOCK_SIZE));
        prop_assert_eq!(blocks.iter().map(|b| b.len()).sum::<usize>(), len);
    }
}
