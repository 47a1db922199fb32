use tempfile::TempDir;

use super::*;
use crate::CatalogError;
use crate::Error;

fn setup(shards: &[&str]) -> (TempDir, SledCatalogStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SledCatalogStore::open(dir.path(), "config/localhost:27019").unwrap();
    for s in shards {
        store.add_shard(ShardEntry::new(*s, format!("{s}:27018"))).unwrap();
    }
    (dir, store)
}

fn sharded_foo(store: &SledCatalogStore) -> CollectionEntry {
    store.enable_sharding("db").unwrap();
    store
        .shard_collection("db.foo", ShardKeyPattern::new(["x"]).unwrap(), false)
        .unwrap()
}

#[test]
fn test_create_database_balances_primaries() {
    let (_dir, store) = setup(&["A", "B"]);
    let a = store.create_database("one").unwrap();
    let b = store.create_database("two").unwrap();
    assert_ne!(a.primary_shard, b.primary_shard);

    // idempotent
    let again = store.create_database("one").unwrap();
    assert_eq!(a, again);
}

#[test]
fn test_create_database_without_shards_fails() {
    let (_dir, store) = setup(&[]);
    let err = store.create_database("db").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_enable_sharding_bumps_version_once() {
    let (_dir, store) = setup(&["A"]);
    let created = store.create_database("db").unwrap();
    let enabled = store.enable_sharding("db").unwrap();
    assert!(enabled.partitioned);
    assert!(created.version.is_older_than(&enabled.version));

    let again = store.enable_sharding("db").unwrap();
    assert_eq!(enabled.version, again.version);
}

/// # Case: shard collection
///
/// ## Criterias:
/// 1. exactly one chunk `[MinKey, MaxKey)` on the primary at `1|0`
/// 2. re-sharding with the same pattern is a no-op
/// 3. re-sharding with another pattern fails
#[test]
fn test_shard_collection_creates_single_chunk() {
    let (_dir, store) = setup(&["A", "B"]);
    let coll = sharded_foo(&store);
    let primary = store.get_database("db").unwrap().primary_shard;

    let chunks = store.get_chunks("db.foo").unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].range, ChunkRange::full());
    assert_eq!(chunks[0].shard, primary);
    assert_eq!(chunks[0].version, ChunkVersion::initial(coll.epoch));

    let same = store
        .shard_collection("db.foo", ShardKeyPattern::new(["x"]).unwrap(), false)
        .unwrap();
    assert_eq!(same.epoch, coll.epoch);

    let err = store
        .shard_collection("db.foo", ShardKeyPattern::new(["y"]).unwrap(), false)
        .unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::AlreadyExists { .. })));
}

#[test]
fn test_shard_collection_requires_enable_sharding() {
    let (_dir, store) = setup(&["A"]);
    store.create_database("db").unwrap();
    let err = store
        .shard_collection("db.foo", ShardKeyPattern::new(["x"]).unwrap(), false)
        .unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::ShardingNotEnabled(_))));
}

#[test]
fn test_split_produces_ordered_partition() {
    let (_dir, store) = setup(&["A"]);
    let coll = sharded_foo(&store);

    let v = store.commit_split("db.foo", &ShardKey::single(100)).unwrap();
    assert_eq!(v, ChunkVersion::new(1, 2, coll.epoch));
    store.commit_split("db.foo", &ShardKey::single(-5)).unwrap();

    let chunks = store.get_chunks("db.foo").unwrap();
    let ranges: Vec<_> = chunks.iter().map(|c| c.range.clone()).collect();
    assert_eq!(
        ranges,
        vec![
            ChunkRange::new(KeyBound::Min, KeyBound::key(-5)),
            ChunkRange::new(KeyBound::key(-5), KeyBound::key(100)),
            ChunkRange::new(KeyBound::key(100), KeyBound::Max),
        ]
    );
    let max = collection_version(&chunks).unwrap();
    assert_eq!((max.major, max.minor), (1, 4));
}

#[test]
fn test_split_on_boundary_is_rejected() {
    let (_dir, store) = setup(&["A"]);
    sharded_foo(&store);
    store.commit_split("db.foo", &ShardKey::single(100)).unwrap();

    let err = store.commit_split("db.foo", &ShardKey::single(100)).unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::InvalidSplitPoint { .. })));

    let err = store
        .commit_split("db.foo", &ShardKey(vec![1.into(), 2.into()]))
        .unwrap_err();
    assert!(matches!(err, Error::Catalog(CatalogError::InvalidSplitPoint { .. })));
}

/// # Case: migration commit
///
/// ## Criterias:
/// 1. ownership moves and the major version increases
/// 2. a second commit with the old expected version fails with VersionMismatch
#[test]
fn test_commit_chunk_migration_is_guarded_by_version() {
    let (_dir, store) = setup(&["A", "B"]);
    sharded_foo(&store);
    let primary = store.get_database("db").unwrap().primary_shard;
    let other = if primary == "A" { "B" } else { "A" };
    store.commit_split("db.foo", &ShardKey::single(100)).unwrap();

    let chunks = store.get_chunks("db.foo").unwrap();
    let upper = chunks.last().unwrap().clone();

    let v = store
        .commit_chunk_migration("db.foo", &upper.range, &primary, other, &upper.version)
        .unwrap();
    assert_eq!((v.major, v.minor), (2, 0));

    let chunks = store.get_chunks("db.foo").unwrap();
    assert_eq!(chunks.last().unwrap().shard, other);
    assert_eq!(chunks.first().unwrap().shard, primary);

    let err = store
        .commit_chunk_migration("db.foo", &upper.range, &primary, other, &upper.version)
        .unwrap_err();
    match err {
        Error::Catalog(CatalogError::VersionMismatch { actual, .. }) => {
            assert_eq!(actual, Some(v));
        }
        e => panic!("unexpected error: {e:?}"),
    }
}

#[test]
fn test_commit_chunk_migration_rejects_unknown_range() {
    let (_dir, store) = setup(&["A", "B"]);
    let coll = sharded_foo(&store);
    let primary = store.get_database("db").unwrap().primary_shard;

    let err = store
        .commit_chunk_migration(
            "db.foo",
            &ChunkRange::new(KeyBound::key(5), KeyBound::Max),
            &primary,
            "B",
            &ChunkVersion::initial(coll.epoch),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Catalog(CatalogError::VersionMismatch { actual: None, .. })
    ));
}

#[test]
fn test_drop_and_recreate_gets_new_epoch() {
    let (_dir, store) = setup(&["A"]);
    let first = sharded_foo(&store);
    store.commit_split("db.foo", &ShardKey::single(7)).unwrap();

    store.drop_collection("db.foo").unwrap();
    assert!(store.get_collection("db.foo").unwrap_err().is_not_found());
    assert!(store.get_collections("db").unwrap().is_empty());

    let second = store
        .shard_collection("db.foo", ShardKeyPattern::new(["x"]).unwrap(), false)
        .unwrap();
    assert_ne!(first.epoch, second.epoch);
    let chunks = store.get_chunks("db.foo").unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].version, ChunkVersion::initial(second.epoch));
}

#[test]
fn test_chunks_reassignment_skips_changed_chunks() {
    let (_dir, store) = setup(&["A", "B"]);
    sharded_foo(&store);
    let primary = store.get_database("db").unwrap().primary_shard;
    let other = if primary == "A" { "B" } else { "A" };
    store.commit_split("db.foo", &ShardKey::single(0)).unwrap();

    let mut chunks = store.get_chunks("db.foo").unwrap();
    // stale view of the first chunk
    chunks[0].version = chunks[0].version.next_major();

    let moved = store.commit_chunks_reassignment(&chunks, other).unwrap();
    assert_eq!(moved, 1);
    let after = store.get_chunks_for_shard(other).unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].range.min, KeyBound::key(0));
}

#[test]
fn test_move_primary_bumps_database_version() {
    let (_dir, store) = setup(&["A", "B"]);
    let db = store.create_database("db").unwrap();
    let other = if db.primary_shard == "A" { "B" } else { "A" };

    let moved = store.commit_move_primary("db", other).unwrap();
    assert_eq!(moved.primary_shard, other);
    assert!(db.version.is_older_than(&moved.version));
    assert_eq!(store.get_databases_for_shard(other).unwrap().len(), 1);
}

#[test]
fn test_catalog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let epoch;
    {
        let store = SledCatalogStore::open(dir.path(), "config").unwrap();
        store.add_shard(ShardEntry::new("A", "a")).unwrap();
        epoch = sharded_foo(&store).epoch;
        store.commit_split("db.foo", &ShardKey::single("m")).unwrap();
    }
    let store = SledCatalogStore::open(dir.path(), "config").unwrap();
    assert_eq!(store.get_collection("db.foo").unwrap().epoch, epoch);
    assert_eq!(store.get_chunks("db.foo").unwrap().len(), 2);
}

#[test]
fn test_log_position_is_monotonic() {
    let (_dir, store) = setup(&["A"]);
    let a = store.current_log_position().unwrap();
    let b = store.current_log_position().unwrap();
    assert!(a < b);
}
