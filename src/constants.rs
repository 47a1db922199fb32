// -
// Database namespaces

/// Sled trees of the authoritative catalog
pub(crate) const CATALOG_DATABASES_TREE: &str = "config.databases";
pub(crate) const CATALOG_COLLECTIONS_TREE: &str = "config.collections";
pub(crate) const CATALOG_CHUNKS_TREE: &str = "config.chunks";
pub(crate) const CATALOG_SHARDS_TREE: &str = "config.shards";

/// Sled trees of a shard's persisted routing cache
pub(crate) const CACHE_DATABASES_TREE: &str = "cache.databases";
pub(crate) const CACHE_COLLECTIONS_TREE: &str = "cache.collections";
pub(crate) const CACHE_CHUNKS_TREE: &str = "cache.chunks";

/// Shard-local bookkeeping
pub(crate) const ADMIN_VERSION_TREE: &str = "admin.system.version";
pub(crate) const RANGE_DELETIONS_TREE: &str = "config.rangeDeletions";
pub(crate) const TRANSACTIONS_TREE: &str = "config.transactions";

/// Documents of every namespace, keyed by namespace then storage key
pub(crate) const DOCUMENTS_TREE: &str = "data.documents";

/// Sled entry keys
pub(crate) const MIN_OP_TIME_RECOVERY_KEY: &str = "minOpTimeRecovery";
