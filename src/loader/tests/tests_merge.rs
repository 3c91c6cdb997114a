//! Merge planning: how a snapshot splits, extends and fills stored ranges.
//!
//! Each test starts from a fresh `MemoryStore`, loads one or more runs and
//! checks both the stored layout and the query answers.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use serde_json::json;

    use crate::address::Address;
    use crate::encoding::CodecError;
    use crate::keys::encode_key;
    use crate::loader::tests::helpers::*;
    use crate::loader::{LoadConfig, LoadError, LoadStats, MergeEngine, Snapshot};
    use crate::store::{MemoryStore, Store, WriteBatch};

    fn row(begin: &str, end: &str, datetimes: &[&str]) -> (String, String, Vec<String>) {
        (
            begin.to_string(),
            end.to_string(),
            datetimes.iter().map(|d| d.to_string()).collect(),
        )
    }

    // ----------------------------------------------------------------
    // Fresh ranges
    // ----------------------------------------------------------------

    #[test]
    fn merge__first_load_stores_each_record() {
        let store = MemoryStore::new();
        let stats = load(
            &store,
            vec![
                snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1})),
                snap("1.0.2.0", "1.0.2.255", "2010", json!({"x": 2})),
            ],
        );

        assert_eq!(
            stats,
            LoadStats {
                snapshots: 2,
                ranges_written: 2,
                ranges_deleted: 0,
                batches: 1,
            }
        );
        assert_eq!(
            layout(&store),
            vec![
                row("1.0.0.0", "1.0.0.255", &["2010"]),
                row("1.0.2.0", "1.0.2.255", &["2010"]),
            ]
        );
        assert_eq!(latest(&store, "1.0.1.0"), None);
    }

    #[test]
    fn merge__exact_match_appends_history() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.255.255.255", "2010", json!({"x": 1}))]);
        load(&store, vec![snap("1.0.0.0", "1.255.255.255", "2011", json!({"x": 2}))]);

        assert_eq!(
            layout(&store),
            vec![row("1.0.0.0", "1.255.255.255", &["2010", "2011"])]
        );
        assert_eq!(latest(&store, "1.9.9.9"), Some(attrs(json!({"x": 2}))));
        assert_eq!(at(&store, "1.9.9.9", "2010-12-31"), Some(attrs(json!({"x": 1}))));
    }

    // ----------------------------------------------------------------
    // Splits
    // ----------------------------------------------------------------

    /// # Scenario
    /// A snapshot strictly inside a stored range splits it in three.
    ///
    /// # Starting environment
    /// One stored range `1.0.0.0 - 1.255.255.255` at 2010.
    ///
    /// # Actions
    /// 1. Load `1.2.0.0 - 1.2.255.255` at 2011.
    ///
    /// # Expected behavior
    /// The outer pieces keep the old single-entry history; the middle
    /// piece gains the 2011 entry. The old key survives as the key of the
    /// right-hand piece, so nothing is deleted.
    #[test]
    fn merge__inner_snapshot_splits_range_in_three() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.255.255.255", "2010", json!({"x": 1}))]);
        let stats = load(&store, vec![snap("1.2.0.0", "1.2.255.255", "2011", json!({"x": 2}))]);

        assert_eq!(
            layout(&store),
            vec![
                row("1.0.0.0", "1.1.255.255", &["2010"]),
                row("1.2.0.0", "1.2.255.255", &["2010", "2011"]),
                row("1.3.0.0", "1.255.255.255", &["2010"]),
            ]
        );
        assert_eq!(stats.ranges_written, 3);
        assert_eq!(stats.ranges_deleted, 0);

        assert_eq!(latest(&store, "1.1.255.255"), Some(attrs(json!({"x": 1}))));
        assert_eq!(latest(&store, "1.2.0.0"), Some(attrs(json!({"x": 2}))));
        assert_eq!(at(&store, "1.2.0.0", "2010"), Some(attrs(json!({"x": 1}))));
        assert_eq!(latest(&store, "1.3.0.0"), Some(attrs(json!({"x": 1}))));
    }

    #[test]
    fn merge__split_keeps_outer_part_answering_old_value() {
        let store = MemoryStore::new();
        load(
            &store,
            vec![snap("1.0.0.0", "1.255.255.255", "2020-01-01", json!({"country": "X"}))],
        );
        load(
            &store,
            vec![snap("1.0.0.0", "1.0.255.255", "2021-01-01", json!({"country": "Y"}))],
        );

        assert_eq!(
            at(&store, "1.0.0.0", "2021-01-01"),
            Some(attrs(json!({"country": "Y"})))
        );
        assert_eq!(
            at(&store, "1.0.0.0", "2020-01-01"),
            Some(attrs(json!({"country": "X"})))
        );
        assert_eq!(
            at(&store, "1.1.0.0", "2021-01-01"),
            Some(attrs(json!({"country": "X"})))
        );
    }

    /// # Scenario
    /// A snapshot spanning two stored ranges, the gap between them and
    /// unknown space past the last one.
    ///
    /// # Expected behavior
    /// Covered parts gain an entry, the gap and the tail become fresh
    /// ranges holding only the new entry, and the part of the first range
    /// before the snapshot is untouched.
    #[test]
    fn merge__snapshot_spanning_ranges_and_gaps() {
        let store = MemoryStore::new();
        load(
            &store,
            vec![
                snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1})),
                snap("1.0.2.0", "1.0.2.255", "2010", json!({"x": 2})),
            ],
        );
        load(&store, vec![snap("1.0.0.128", "1.0.3.255", "2011", json!({"x": 3}))]);

        assert_eq!(
            layout(&store),
            vec![
                row("1.0.0.0", "1.0.0.127", &["2010"]),
                row("1.0.0.128", "1.0.0.255", &["2010", "2011"]),
                row("1.0.1.0", "1.0.1.255", &["2011"]),
                row("1.0.2.0", "1.0.2.255", &["2010", "2011"]),
                row("1.0.3.0", "1.0.3.255", &["2011"]),
            ]
        );

        assert_eq!(at(&store, "1.0.1.7", "2010"), None);
        assert_eq!(at(&store, "1.0.1.7", "2011"), Some(attrs(json!({"x": 3}))));
        assert_eq!(at(&store, "1.0.2.7", "2010"), Some(attrs(json!({"x": 2}))));
        assert_eq!(latest(&store, "1.0.4.0"), None);
    }

    #[test]
    fn merge__snapshot_before_all_ranges_leaves_them_alone() {
        let store = MemoryStore::new();
        load(&store, vec![snap("9.0.0.0", "9.0.0.255", "2010", json!({"x": 9}))]);
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2011", json!({"x": 1}))]);

        assert_eq!(
            layout(&store),
            vec![
                row("1.0.0.0", "1.0.0.255", &["2011"]),
                row("9.0.0.0", "9.0.0.255", &["2010"]),
            ]
        );
    }

    // ----------------------------------------------------------------
    // Timestamps
    // ----------------------------------------------------------------

    #[test]
    fn merge__same_timestamp_twice_is_idempotent() {
        let once = MemoryStore::new();
        let twice = MemoryStore::new();
        let base = || vec![snap("1.0.0.0", "1.255.255.255", "2010", json!({"x": 1}))];
        let update = || {
            vec![
                snap("1.0.0.0", "1.0.255.255", "2011", json!({"x": 2})),
                snap("1.1.0.0", "1.1.0.255", "2011", json!({"x": 3})),
            ]
        };

        load(&once, base());
        load(&once, update());

        load(&twice, base());
        load(&twice, update());
        load(&twice, update());

        assert_eq!(once.dump().unwrap(), twice.dump().unwrap());
        assert_eq!(datetimes(&twice, "1.0.0.1"), ["2010", "2011"]);
    }

    #[test]
    fn merge__same_timestamp_replaces_attributes() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1, "y": 1}))]);
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 5}))]);

        assert_eq!(datetimes(&store, "1.0.0.0"), ["2010"]);
        assert_eq!(latest(&store, "1.0.0.0"), Some(attrs(json!({"x": 5}))));
    }

    #[test]
    fn merge__older_timestamp_is_inserted_in_order() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2013", json!({"x": 4}))]);
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1}))]);
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2011", json!({"x": 7}))]);

        assert_eq!(datetimes(&store, "1.0.0.9"), ["2010", "2011", "2013"]);
        assert_eq!(latest(&store, "1.0.0.9"), Some(attrs(json!({"x": 4}))));
        assert_eq!(at(&store, "1.0.0.9", "2012"), Some(attrs(json!({"x": 7}))));
    }

    // ----------------------------------------------------------------
    // Coalescing
    // ----------------------------------------------------------------

    #[test]
    fn merge__adjacent_records_with_equal_history_coalesce() {
        let store = MemoryStore::new();
        load(
            &store,
            vec![
                snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1})),
                snap("1.0.1.0", "1.0.1.255", "2010", json!({"x": 1})),
                snap("1.0.2.0", "1.0.2.255", "2010", json!({"x": 2})),
            ],
        );

        assert_eq!(
            layout(&store),
            vec![
                row("1.0.0.0", "1.0.1.255", &["2010"]),
                row("1.0.2.0", "1.0.2.255", &["2010"]),
            ]
        );
    }

    #[test]
    fn merge__split_pieces_rejoin_once_histories_match_again() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1}))]);
        load(
            &store,
            vec![
                snap("1.0.0.0", "1.0.0.127", "2011", json!({"x": 2})),
                snap("1.0.0.128", "1.0.0.255", "2011", json!({"x": 2})),
            ],
        );

        assert_eq!(
            layout(&store),
            vec![row("1.0.0.0", "1.0.0.255", &["2010", "2011"])]
        );
    }

    #[test]
    fn merge__merge_adjacent_off_keeps_pieces_with_same_answers() {
        let merged = MemoryStore::new();
        let split = MemoryStore::new();
        let no_merge = LoadConfig {
            merge_adjacent: false,
            ..LoadConfig::default()
        };
        let files = || {
            vec![
                vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1}))],
                vec![
                    snap("1.0.0.0", "1.0.0.127", "2011", json!({"x": 2})),
                    snap("1.0.0.128", "1.0.0.255", "2011", json!({"x": 2})),
                    snap("1.0.1.0", "1.0.1.255", "2011", json!({"x": 2})),
                ],
            ]
        };
        for file in files() {
            load(&merged, file);
        }
        for file in files() {
            load_with(&split, no_merge, file);
        }

        assert_eq!(stored(&merged).len(), 2);
        assert_eq!(stored(&split).len(), 3);

        for addr in ["0.255.255.255", "1.0.0.0", "1.0.0.127", "1.0.0.128", "1.0.1.9", "1.0.2.0"] {
            for when in ["2009", "2010", "2011", "2038"] {
                assert_eq!(at(&merged, addr, when), at(&split, addr, when), "{addr} @ {when}");
            }
            assert_eq!(datetimes(&merged, addr), datetimes(&split, addr), "{addr}");
        }
    }

    // ----------------------------------------------------------------
    // Address families and extremes
    // ----------------------------------------------------------------

    #[test]
    fn merge__ipv4_and_ipv6_ranges_coexist() {
        let store = MemoryStore::new();
        load(
            &store,
            vec![
                snap("1.0.0.0", "1.0.0.255", "2010", json!({"family": 4})),
                snap("2001:db8::", "2001:db8::ffff", "2010", json!({"family": 6})),
            ],
        );

        assert_eq!(latest(&store, "1.0.0.1"), Some(attrs(json!({"family": 4}))));
        assert_eq!(latest(&store, "::ffff:1.0.0.1"), Some(attrs(json!({"family": 4}))));
        assert_eq!(latest(&store, "2001:db8::42"), Some(attrs(json!({"family": 6}))));
        assert_eq!(latest(&store, "2001:db8::1:0"), None);
        assert_eq!(latest(&store, "1.0.0.1"), latest(&store, "::ffff:1.0.0.1"));
    }

    #[test]
    fn merge__whole_address_space_can_be_split_at_the_top() {
        init_tracing();
        let store = MemoryStore::new();
        let engine = MergeEngine::new(&store, LoadConfig::default());
        engine
            .load([Snapshot::new(Address::MIN, Address::MAX, "2010", attrs(json!({"x": 0})))])
            .unwrap();
        engine
            .load([Snapshot::new(ip("ffff::"), Address::MAX, "2011", attrs(json!({"x": 1})))])
            .unwrap();

        let ranges = stored(&store);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].begin, Address::MIN);
        assert_eq!(ranges[0].end, ip("fffe:ffff:ffff:ffff:ffff:ffff:ffff:ffff"));
        assert_eq!(ranges[1].end, Address::MAX);
        assert_eq!(ranges[1].history.len(), 2);
        assert_eq!(latest(&store, "::"), Some(attrs(json!({"x": 0}))));
        assert_eq!(
            latest(&store, "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"),
            Some(attrs(json!({"x": 1})))
        );
    }

    // ----------------------------------------------------------------
    // Corruption
    // ----------------------------------------------------------------

    #[test]
    fn merge__corrupt_stored_range_aborts_without_writing() {
        let store = MemoryStore::new();
        load(&store, vec![snap("1.0.0.0", "1.0.0.255", "2010", json!({"x": 1}))]);

        let key = encode_key(ip("1.0.0.255"));
        let mut batch = WriteBatch::new();
        batch.put(key, b"not a history".to_vec());
        store.write_batch(batch).unwrap();
        let before = store.dump().unwrap();

        let err = MergeEngine::new(&store, LoadConfig::default())
            .load(vec![
                snap("0.0.0.0", "0.0.0.255", "2011", json!({"x": 0})),
                snap("1.0.0.0", "1.0.0.255", "2011", json!({"x": 2})),
            ])
            .unwrap_err();

        match err {
            LoadError::Corrupt { key, source } => {
                assert_eq!(key, "1.0.0.255");
                assert!(matches!(source, CodecError::ChecksumMismatch { .. }));
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
        assert_eq!(store.dump().unwrap(), before);
    }
}
