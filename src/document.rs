//! Typed document model.
//!
//! Documents carry a fixed, enumerated set of value types. Anything else is
//! rejected at the boundary by [`Document::validate`] instead of being
//! propagated through the routing core.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::DocumentError;
use crate::Result;

/// A single field value. Integers sort before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "\"{v}\""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Creates a document with a generated unique id.
    pub fn with_generated_id() -> Self {
        Self::new(nanoid::nanoid!())
    }

    pub fn with(
        mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(
        &self,
        field: &str,
    ) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// String values are stored NUL-terminated inside ordered keys, so NUL
    /// bytes are not representable.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.id.contains('\0') {
            return Err(DocumentError::MissingId.into());
        }
        for (name, value) in &self.fields {
            if name.is_empty() || name.contains('\0') {
                return Err(DocumentError::InvalidValue(name.clone()).into());
            }
            if let FieldValue::Str(s) = value {
                if s.contains('\0') {
                    return Err(DocumentError::InvalidValue(name.clone()).into());
                }
            }
        }
        Ok(())
    }
}

/// Equality filter on the id and any number of fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    id: Option<String>,
    fields: BTreeMap<String, FieldValue>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn eq(
        mut self,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn with_id(
        mut self,
        id: impl Into<String>,
    ) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn get(
        &self,
        field: &str,
    ) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn matches(
        &self,
        doc: &Document,
    ) -> bool {
        if let Some(id) = &self.id {
            if doc.id() != id {
                return false;
            }
        }
        self.fields.iter().all(|(k, v)| doc.get(k) == Some(v))
    }
}

/// Update operators supported by the write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentUpdate {
    /// Overwrite the given fields, keep the others
    Set(BTreeMap<String, FieldValue>),
    /// Replace every field, keep the id
    Replace(BTreeMap<String, FieldValue>),
    /// Add to integer fields, missing fields start at zero
    Inc(BTreeMap<String, i64>),
}

impl DocumentUpdate {
    pub fn set(
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) -> Self {
        DocumentUpdate::Set(BTreeMap::from([(field.into(), value.into())]))
    }

    pub fn inc(
        field: impl Into<String>,
        by: i64,
    ) -> Self {
        DocumentUpdate::Inc(BTreeMap::from([(field.into(), by)]))
    }

    /// Computes the post-image without touching storage.
    pub fn apply(
        &self,
        doc: &Document,
    ) -> Result<Document> {
        let mut post = doc.clone();
        match self {
            DocumentUpdate::Set(fields) => {
                for (k, v) in fields {
                    post.fields.insert(k.clone(), v.clone());
                }
            }
            DocumentUpdate::Replace(fields) => {
                post.fields = fields.clone();
            }
            DocumentUpdate::Inc(fields) => {
                for (k, by) in fields {
                    let current = match post.fields.get(k) {
                        None => 0,
                        Some(FieldValue::Int(v)) => *v,
                        Some(FieldValue::Str(_)) => {
                            return Err(DocumentError::InvalidValue(k.clone()).into())
                        }
                    };
                    let next = current
                        .checked_add(*by)
                        .ok_or_else(|| DocumentError::InvalidValue(k.clone()))?;
                    post.fields.insert(k.clone(), FieldValue::Int(next));
                }
            }
        }
        post.validate()?;
        Ok(post)
    }
}
