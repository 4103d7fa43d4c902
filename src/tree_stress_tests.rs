use crate::interval::{HtInterval, StateInterval, StateValue, TimeRange, Timestamp};
use crate::storage::{NodeType, COMMON_HEADER_SIZE, NO_PARENT, TREE_HEADER_SIZE};
use crate::{ErrorKind, HistoryTree, HistoryTreeConfig};
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;
use tempfile::TempDir;

#[cfg(test)]
mod stress_tests {
    use super::*;
    use quickcheck::{QuickCheck, TestResult};
    use rand::distributions::Alphanumeric;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Config whose leaves hold exactly `per_leaf` time ranges
    fn config_for(path: &Path, per_leaf: usize, max_children: usize) -> HistoryTreeConfig {
        HistoryTreeConfig::with_path(path)
            .with_block_size(COMMON_HEADER_SIZE + per_leaf * 16 + 8)
            .with_max_children(max_children)
            .with_cache_slots(16)
    }

    fn block_bytes(path: &Path, block_size: usize, seq: u32) -> Vec<u8> {
        let file = std::fs::read(path).expect("read tree file");
        let offset = TREE_HEADER_SIZE + seq as usize * block_size;
        file[offset..offset + block_size].to_vec()
    }

    fn build_tree(dir: &TempDir, per_leaf: usize, max_children: usize, count: i64) -> HistoryTree<TimeRange> {
        let config = config_for(&dir.path().join("tree.ht"), per_leaf, max_children);
        let mut tree = HistoryTree::create(config).expect("Failed to create tree");
        for i in 0..count {
            tree.insert(TimeRange::new(i * 10, i * 10 + 5)).expect("Insert failed");
        }
        tree
    }

    #[test]
    fn scenario_first_leaf_then_new_root() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build_tree(&temp_dir, 4, 3, 4);

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.depth(), 1);

        tree.insert(TimeRange::new(40, 45)).unwrap();
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.depth(), 2);

        let root = tree.root();
        assert_eq!(root.sequence_number(), 1);
        assert_eq!(root.node_type(), NodeType::Branch);
        assert_eq!(root.children().iter().map(|c| c.seq).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(tree.latest_leaf().start(), 40);
        tree.check_integrity().unwrap();
    }

    #[test]
    fn scenario_full_root_grows_depth_without_touching_closed_nodes() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build_tree(&temp_dir, 4, 3, 12);
        let path = tree.config().path.clone();
        let block_size = tree.config().block_size;

        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.root().child_count(), 3);

        let before: Vec<Vec<u8>> = [0, 2].iter().map(|&seq| block_bytes(&path, block_size, seq)).collect();

        tree.insert(TimeRange::new(120, 125)).unwrap();
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.node_count(), 7);

        let after: Vec<Vec<u8>> = [0, 2].iter().map(|&seq| block_bytes(&path, block_size, seq)).collect();
        assert_eq!(before, after);

        let old_root = tree.get_node(1).unwrap();
        assert!(old_root.is_closed());
        assert_eq!(old_root.parent_sequence_number(), 4);
        tree.check_integrity().unwrap();
    }

    #[test]
    fn scenario_close_tree_fixes_latest_branch_end() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build_tree(&temp_dir, 4, 3, 30);
        let branch: Vec<u32> = tree.latest_branch().iter().map(|n| n.sequence_number()).collect();

        tree.close_tree(1_000).unwrap();

        for seq in branch {
            let node = tree.get_node(seq).unwrap();
            assert!(node.is_closed());
            assert_eq!(node.end(), 1_000);
        }
        let err = tree.insert(TimeRange::new(2_000, 2_001)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        tree.check_integrity().unwrap();
    }

    #[test]
    fn scenario_reopen_reconstructs_tree() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir.path().join("reopen.ht"), 4, 3).with_provider_version(7);
        let path = config.path.clone();
        let mut tree: HistoryTree<TimeRange> = HistoryTree::create(config).unwrap();
        for i in 0..100 {
            tree.insert(TimeRange::new(i * 3, i * 3 + 7)).unwrap();
        }
        tree.close_tree(400).unwrap();

        let expected: Vec<_> = (0..tree.node_count()).map(|seq| tree.get_node(seq).unwrap()).collect();
        let node_count = tree.node_count();
        let depth = tree.depth();
        tree.close_file().unwrap();

        let reopened: HistoryTree<TimeRange> = HistoryTree::open(&path, 7).unwrap();
        assert!(reopened.is_closed());
        assert_eq!(reopened.node_count(), node_count);
        assert_eq!(reopened.depth(), depth);
        assert_eq!(reopened.tree_end(), 400);
        for (seq, node) in expected.iter().enumerate() {
            assert_eq!(*reopened.get_node(seq as u32).unwrap(), **node);
        }
        reopened.check_integrity().unwrap();

        let err = HistoryTree::<TimeRange>::open(&path, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Version);
    }

    #[test]
    fn reopen_unclosed_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let tree = build_tree(&temp_dir, 4, 3, 20);
        let path = tree.config().path.clone();
        drop(tree);

        let err = HistoryTree::<TimeRange>::open(&path, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupted);
    }

    #[test]
    fn test_reopen_truncated_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build_tree(&temp_dir, 4, 3, 20);
        let path = tree.config().path.clone();
        let block_size = tree.config().block_size as u64;
        tree.close_tree(200).unwrap();
        tree.close_file().unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - block_size).unwrap();
        drop(file);

        let err = HistoryTree::<TimeRange>::open(&path, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        match err {
            crate::Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("expected an I/O error, got {other}"),
        }
    }

    #[test]
    fn sequence_numbers_and_parents() {
        let temp_dir = TempDir::new().unwrap();
        // three ranges per leaf, two children per branch
        let mut tree = build_tree(&temp_dir, 3, 2, 3);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root().parent_sequence_number(), NO_PARENT);

        tree.insert(TimeRange::new(30, 35)).unwrap();
        assert_eq!(tree.get_node(0).unwrap().parent_sequence_number(), 1);
        let seqs: Vec<u32> = tree.latest_branch().iter().map(|n| n.sequence_number()).collect();
        assert_eq!(seqs, vec![1, 2]);

        for i in 4..7 {
            tree.insert(TimeRange::new(i * 10, i * 10 + 5)).unwrap();
        }
        let seqs: Vec<u32> = tree.latest_branch().iter().map(|n| n.sequence_number()).collect();
        let parents: Vec<i32> = tree.latest_branch().iter().map(|n| n.parent_sequence_number()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(parents, vec![-1, 3, 4]);
        assert_eq!(tree.get_node(1).unwrap().parent_sequence_number(), 3);
        assert_eq!(tree.get_node(2).unwrap().parent_sequence_number(), 1);
        tree.check_integrity().unwrap();
    }

    fn random_state_interval(rng: &mut StdRng, start: Timestamp) -> StateInterval {
        let end = start + rng.gen_range(0..500);
        let attribute = rng.gen_range(0..64);
        let value = match rng.gen_range(0..5) {
            0 => StateValue::Null,
            1 => StateValue::Int(rng.r#gen()),
            2 => StateValue::Long(rng.r#gen()),
            3 => StateValue::Double(rng.gen_range(-1e6..1e6)),
            _ => {
                let len = rng.gen_range(0..60);
                StateValue::Str((0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect())
            }
        };
        StateInterval::new(start, end, attribute, value)
    }

    #[test]
    fn stress_variable_size_intervals() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("states.ht");
        let config = HistoryTreeConfig::with_path(&path)
            .with_block_size(1024)
            .with_max_children(4)
            .with_cache_slots(32);
        let mut tree: HistoryTree<StateInterval> = HistoryTree::create(config).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        let mut inserted = Vec::new();
        let mut start = 0;
        let started = Instant::now();
        for _ in 0..5_000 {
            start += rng.gen_range(0..4);
            let interval = random_state_interval(&mut rng, start);
            inserted.push(interval.clone());
            tree.insert(interval).expect("Insert failed");
        }
        let end = tree.tree_end();
        tree.close_tree(end).unwrap();
        println!(
            "Inserted {} variable-size intervals into {} nodes (depth {}) in {:?}",
            inserted.len(),
            tree.node_count(),
            tree.depth(),
            started.elapsed()
        );

        tree.check_integrity().unwrap();
        assert!(tree.depth() >= 3);

        let mut stored = Vec::new();
        for seq in 0..tree.node_count() {
            let node = tree.get_node(seq).unwrap();
            let used: usize = node.intervals().iter().map(|i| i.size_on_disk()).sum();
            assert!(node.header_size() + used <= node.block_size());
            stored.extend(node.intervals().iter().cloned());
        }
        let key = |i: &StateInterval| (i.start, i.end, i.attribute, format!("{:?}", i.value));
        stored.sort_by_key(key);
        inserted.sort_by_key(key);
        assert_eq!(stored, inserted);
    }

    #[test]
    fn property_counts_never_decrease() {
        fn prop(steps: Vec<(u8, u8)>) -> TestResult {
            if steps.is_empty() {
                return TestResult::discard();
            }
            let temp_dir = TempDir::new().unwrap();
            let config = config_for(&temp_dir.path().join("prop.ht"), 4, 3);
            let mut tree: HistoryTree<TimeRange> = HistoryTree::create(config).unwrap();

            let mut start: Timestamp = 0;
            let mut last_count = tree.node_count();
            let mut last_depth = tree.depth();
            for (gap, len) in steps {
                start += gap as Timestamp % 8;
                if tree.insert(TimeRange::new(start, start + len as Timestamp)).is_err() {
                    return TestResult::failed();
                }
                if tree.node_count() < last_count || tree.depth() < last_depth {
                    return TestResult::failed();
                }
                last_count = tree.node_count();
                last_depth = tree.depth();
            }
            TestResult::from_bool(tree.check_integrity().is_ok())
        }

        QuickCheck::new()
            .tests(50)
            .quickcheck(prop as fn(Vec<(u8, u8)>) -> TestResult);
    }

    #[test]
    fn stress_concurrent_readers_after_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build_tree(&temp_dir, 8, 4, 2_000);
        let path = tree.config().path.clone();
        tree.close_tree(20_000).unwrap();
        tree.close_file().unwrap();

        let reader: Arc<HistoryTree<TimeRange>> = Arc::new(HistoryTree::open(&path, 0).expect("Failed to reopen"));
        let node_count = reader.node_count();
        let num_threads = 8;
        let barrier = Arc::new(Barrier::new(num_threads));

        let mut handles = vec![];
        for thread_id in 0..num_threads {
            let reader = reader.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let mut rng = StdRng::seed_from_u64(thread_id as u64);
                let mut intervals = 0;
                for _ in 0..2_000 {
                    let seq = rng.gen_range(0..node_count);
                    let first = reader.get_node(seq).expect("Read failed");
                    let second = reader.get_node(seq).expect("Read failed");
                    assert_eq!(first, second);
                    intervals += first.intervals().len();
                }
                intervals
            }));
        }

        for handle in handles {
            assert!(handle.join().unwrap() > 0);
        }
    }
}
