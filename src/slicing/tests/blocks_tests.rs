#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    use crate::slicing::blocks::{group_contiguous, ContiguousBlock};

    fn triples(blocks: &[ContiguousBlock]) -> Vec<(u64, u64, Vec<u64>)> {
        blocks.iter().map(|b| (b.start, b.end, b.members.clone())).collect()
    }

    #[test]
    fn test_groups_runs() {
        let blocks = group_contiguous(&[1, 2, 3, 7, 8, 10]);
        assert_eq!(
            triples(&blocks),
            vec![(1, 4, vec![1, 2, 3]), (7, 9, vec![7, 8]), (10, 11, vec![10])]
        );
    }

    #[test]
    fn test_empty_single_and_contiguous() {
        assert!(group_contiguous(&[]).is_empty());
        assert_eq!(triples(&group_contiguous(&[42])), vec![(42, 43, vec![42])]);

        let all: Vec<u64> = (100..200).collect();
        let blocks = group_contiguous(&all);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].range(), 100..200);
        assert_eq!(blocks[0].len(), 100);
    }

    #[test]
    fn test_unsorted_input_is_sorted_first() {
        let blocks = group_contiguous(&[9, 3, 2, 4]);
        assert_eq!(triples(&blocks), vec![(2, 5, vec![2, 3, 4]), (9, 10, vec![9])]);
    }

    #[test]
    fn test_idempotent() {
        let ids = [5, 6, 8, 9, 10, 20];
        assert_eq!(group_contiguous(&ids), group_contiguous(&ids));
    }

    #[test]
    fn test_partition_properties_on_random_selections() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut ids: Vec<u64> = (0..500u64).filter(|_| rng.random_bool(0.3)).collect();
            let sorted = ids.clone();
            ids.shuffle(&mut rng);

            let blocks = group_contiguous(&ids);
            let flattened: Vec<u64> = blocks.iter().flat_map(|b| b.members.iter().copied()).collect();
            assert_eq!(flattened, sorted);

            for block in &blocks {
                assert!(!block.is_empty());
                assert!(block.members.windows(2).all(|w| w[1] == w[0] + 1));
                assert_eq!(block.start, block.members[0]);
                assert_eq!(block.end, block.members[block.len() - 1] + 1);
            }
            for pair in blocks.windows(2) {
                assert!(pair[1].start >= pair[0].end + 1, "adjacent blocks must not be mergeable");
            }
        }
    }
}
