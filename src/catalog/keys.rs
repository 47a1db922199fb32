use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::Document;
use crate::DocumentError;
use crate::Error;
use crate::FieldValue;
use crate::Filter;
use crate::Result;

/// Values of the shard key fields of one document, in pattern order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<FieldValue>);

impl ShardKey {
    pub fn single(value: impl Into<FieldValue>) -> Self {
        ShardKey(vec![value.into()])
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }
}

impl fmt::Display for ShardKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// A chunk boundary. `Min` and `Max` are the infinity sentinels, so derived
/// ordering places every key strictly between them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyBound {
    Min,
    Key(ShardKey),
    Max,
}

impl KeyBound {
    pub fn key(value: impl Into<FieldValue>) -> Self {
        KeyBound::Key(ShardKey::single(value))
    }
}

impl From<ShardKey> for KeyBound {
    fn from(k: ShardKey) -> Self {
        KeyBound::Key(k)
    }
}

impl fmt::Display for KeyBound {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            KeyBound::Min => write!(f, "MinKey"),
            KeyBound::Key(k) => write!(f, "{k}"),
            KeyBound::Max => write!(f, "MaxKey"),
        }
    }
}

/// Half-open range `[min, max)` of shard key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: KeyBound,
    pub max: KeyBound,
}

impl ChunkRange {
    pub fn new(
        min: KeyBound,
        max: KeyBound,
    ) -> Self {
        Self { min, max }
    }

    /// `[MinKey, MaxKey)`
    pub fn full() -> Self {
        Self::new(KeyBound::Min, KeyBound::Max)
    }

    pub fn contains(
        &self,
        key: &ShardKey,
    ) -> bool {
        self.contains_bound(&KeyBound::Key(key.clone()))
    }

    pub fn contains_bound(
        &self,
        bound: &KeyBound,
    ) -> bool {
        &self.min <= bound && bound < &self.max
    }

    pub fn overlaps(
        &self,
        other: &ChunkRange,
    ) -> bool {
        self.min < other.max && other.min < self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    /// Intersection, or `None` when the ranges are disjoint.
    pub fn intersect(
        &self,
        other: &ChunkRange,
    ) -> Option<ChunkRange> {
        let r = ChunkRange::new(
            self.min.clone().max(other.min.clone()),
            self.max.clone().min(other.max.clone()),
        );
        (!r.is_empty()).then_some(r)
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Ascending shard key pattern such as `{x: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<String>,
}

impl ShardKeyPattern {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Result<Self> {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(DocumentError::EmptyShardKeyPattern.into());
        }
        let mut seen = HashSet::new();
        for f in &fields {
            if f.is_empty() || f.contains('\0') || !seen.insert(f.as_str()) {
                return Err(DocumentError::InvalidValue(f.clone()).into());
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Extracts the shard key, rejecting documents that lack a key field.
    pub fn extract(
        &self,
        doc: &Document,
    ) -> Result<ShardKey> {
        self.fields
            .iter()
            .map(|f| {
                doc.get(f)
                    .cloned()
                    .ok_or_else(|| Error::from(DocumentError::MissingShardKey(f.clone())))
            })
            .collect::<Result<Vec<_>>>()
            .map(ShardKey)
    }

    /// The full shard key when the filter pins every key field by equality.
    pub fn extract_from_filter(
        &self,
        filter: &Filter,
    ) -> Option<ShardKey> {
        self.fields
            .iter()
            .map(|f| filter.get(f).cloned())
            .collect::<Option<Vec<_>>>()
            .map(ShardKey)
    }

    /// Arity must match the pattern.
    pub fn is_valid_key(
        &self,
        key: &ShardKey,
    ) -> bool {
        key.0.len() == self.fields.len()
    }
}
