use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::ChunkEntry;
use crate::ChunkRange;
use crate::ChunkVersion;
use crate::CollectionEntry;
use crate::CatalogError;
use crate::KeyBound;
use crate::Result;
use crate::ShardKey;

/// Immutable routing snapshot of one sharded collection.
///
/// Built from a complete chunk listing and never mutated; a refresh produces
/// a new table that replaces the old one.
#[derive(Debug, Clone)]
pub struct CachedRoutingTable {
    collection: CollectionEntry,
    /// Sorted by range, partitioning `[MinKey, MaxKey)`
    chunks: Vec<ChunkEntry>,
    version: ChunkVersion,
    shard_versions: HashMap<String, ChunkVersion>,
}

impl CachedRoutingTable {
    /// Fails with `InconsistentChunks` unless the chunks cover the whole key
    /// space without gaps or overlaps within a single epoch.
    pub fn new(
        collection: CollectionEntry,
        mut chunks: Vec<ChunkEntry>,
    ) -> Result<Self> {
        let namespace = collection.namespace.clone();
        let inconsistent = |reason: String| CatalogError::InconsistentChunks {
            namespace: namespace.clone(),
            reason,
        };

        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        let mut expected_min = KeyBound::Min;
        for c in &chunks {
            if c.range.min != expected_min {
                return Err(inconsistent(format!("gap or overlap at {}", c.range.min)).into());
            }
            if c.range.is_empty() {
                return Err(inconsistent(format!("empty chunk {}", c.range)).into());
            }
            if c.version.epoch != collection.epoch {
                return Err(inconsistent(format!("chunk {} has a foreign epoch", c.range)).into());
            }
            expected_min = c.range.max.clone();
        }
        if expected_min != KeyBound::Max {
            return Err(inconsistent(format!("key space ends at {expected_min}")).into());
        }

        let mut shard_versions: HashMap<String, ChunkVersion> = HashMap::new();
        for c in &chunks {
            shard_versions
                .entry(c.shard.clone())
                .and_modify(|v| {
                    if v.is_older_than(&c.version) {
                        *v = c.version;
                    }
                })
                .or_insert(c.version);
        }
        let version = shard_versions
            .values()
            .copied()
            .max_by_key(|v| (v.major, v.minor))
            .ok_or_else(|| inconsistent("no chunks".to_string()))?;

        Ok(Self {
            collection,
            chunks,
            version,
            shard_versions,
        })
    }

    pub fn collection(&self) -> &CollectionEntry {
        &self.collection
    }

    pub fn namespace(&self) -> &str {
        &self.collection.namespace
    }

    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    /// Collection version: the highest chunk version.
    pub fn version(&self) -> ChunkVersion {
        self.version
    }

    /// Highest version of the chunks owned by `shard`.
    pub fn shard_version(
        &self,
        shard: &str,
    ) -> Option<ChunkVersion> {
        self.shard_versions.get(shard).copied()
    }

    pub fn find_intersecting_chunk(
        &self,
        key: &ShardKey,
    ) -> &ChunkEntry {
        let bound = KeyBound::Key(key.clone());
        // first chunk whose min is > key, minus one
        let idx = self.chunks.partition_point(|c| c.range.min <= bound);
        &self.chunks[idx.saturating_sub(1)]
    }

    pub fn owner_of(
        &self,
        key: &ShardKey,
    ) -> &str {
        &self.find_intersecting_chunk(key).shard
    }

    pub fn owns(
        &self,
        shard: &str,
        key: &ShardKey,
    ) -> bool {
        self.owner_of(key) == shard
    }

    /// Shards owning some part of `range`, in name order.
    pub fn shards_for_range(
        &self,
        range: &ChunkRange,
    ) -> BTreeSet<String> {
        self.chunks
            .iter()
            .filter(|c| c.range.overlaps(range))
            .map(|c| c.shard.clone())
            .collect()
    }

    pub fn all_shards(&self) -> BTreeSet<String> {
        self.shard_versions.keys().cloned().collect()
    }

    /// Ranges owned by `shard`, adjacent chunks merged.
    pub fn owned_ranges(
        &self,
        shard: &str,
    ) -> Vec<ChunkRange> {
        let mut out: Vec<ChunkRange> = Vec::new();
        for c in self.chunks.iter().filter(|c| c.shard == shard) {
            match out.last_mut() {
                Some(last) if last.max == c.range.min => last.max = c.range.max.clone(),
                _ => out.push(c.range.clone()),
            }
        }
        out
    }

    /// Complement of [`Self::owned_ranges`] within `[MinKey, MaxKey)`.
    pub fn unowned_ranges(
        &self,
        shard: &str,
    ) -> Vec<ChunkRange> {
        let mut out = Vec::new();
        let mut cursor = KeyBound::Min;
        for r in self.owned_ranges(shard) {
            if cursor < r.min {
                out.push(ChunkRange::new(cursor, r.min.clone()));
            }
            cursor = r.max;
        }
        if cursor < KeyBound::Max {
            out.push(ChunkRange::new(cursor, KeyBound::Max));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::ShardKeyPattern;

    fn table(bounds: &[(KeyBound, KeyBound, &str, u64, u64)]) -> Result<CachedRoutingTable> {
        let epoch = Uuid::new_v4();
        let coll = CollectionEntry {
            namespace: "db.foo".to_string(),
            key_pattern: ShardKeyPattern::new(["x"]).unwrap(),
            epoch,
            unique: false,
            dropped: false,
        };
        let chunks = bounds
            .iter()
            .map(|(min, max, shard, major, minor)| ChunkEntry {
                namespace: "db.foo".to_string(),
                range: ChunkRange::new(min.clone(), max.clone()),
                shard: shard.to_string(),
                version: ChunkVersion::new(*major, *minor, epoch),
            })
            .collect();
        CachedRoutingTable::new(coll, chunks)
    }

    #[test]
    fn test_routes_to_intersecting_chunk() {
        let t = table(&[
            (KeyBound::key(100), KeyBound::Max, "B", 2, 0),
            (KeyBound::Min, KeyBound::key(100), "A", 1, 1),
        ])
        .unwrap();
        assert_eq!(t.owner_of(&ShardKey::single(50)), "A");
        assert_eq!(t.owner_of(&ShardKey::single(100)), "B");
        assert_eq!(t.owner_of(&ShardKey::single(i64::MIN)), "A");
        assert_eq!(t.version().major, 2);
        assert_eq!(t.shard_version("A").unwrap().minor, 1);
        assert_eq!(t.all_shards().len(), 2);
    }

    #[test]
    fn test_rejects_gaps() {
        let err = table(&[
            (KeyBound::Min, KeyBound::key(10), "A", 1, 1),
            (KeyBound::key(20), KeyBound::Max, "A", 1, 2),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Catalog(CatalogError::InconsistentChunks { .. })
        ));
        assert!(table(&[(KeyBound::Min, KeyBound::key(10), "A", 1, 0)]).is_err());
    }

    #[test]
    fn test_owned_and_unowned_ranges() {
        let t = table(&[
            (KeyBound::Min, KeyBound::key(0), "A", 1, 1),
            (KeyBound::key(0), KeyBound::key(10), "A", 1, 2),
            (KeyBound::key(10), KeyBound::key(20), "B", 2, 0),
            (KeyBound::key(20), KeyBound::Max, "A", 1, 3),
        ])
        .unwrap();
        assert_eq!(
            t.owned_ranges("A"),
            vec![
                ChunkRange::new(KeyBound::Min, KeyBound::key(10)),
                ChunkRange::new(KeyBound::key(20), KeyBound::Max),
            ]
        );
        assert_eq!(
            t.unowned_ranges("A"),
            vec![ChunkRange::new(KeyBound::key(10), KeyBound::key(20))]
        );
        assert_eq!(t.unowned_ranges("C"), vec![ChunkRange::full()]);
        let r = ChunkRange::new(KeyBound::key(5), KeyBound::key(15));
        assert_eq!(t.shards_for_range(&r).len(), 2);
    }
}
