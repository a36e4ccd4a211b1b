//! Loading and result caching for entsync.
//!
//! `entsync-query` is the **read side**. It turns a logical [`LoadSpec`] into
//! session queries, keeps loaded instances inside the transaction and shares
//! query results between transactions through a [`QueryResultCache`].
//!
//! # Role In The Architecture
//!
//! - **Load specs**: target, identifiers or condition, sort, page, fetch
//!   plans and hints ([`load_spec`]).
//! - **Loader**: implicit flush, identifier batching, plan completion
//!   ([`loader`]).
//! - **Result cache**: sharded, invalidated by entity type on commit
//!   ([`cache`]).
//! - **Extension points**: query transformers and parsers ([`transform`]),
//!   access constraints ([`constraints`]).
//!
//! Writes go through [`entsync_session::CommitCoordinator`]; the loader only
//! asks it to flush, to open sessions and to register what was loaded.

pub mod cache;
pub mod constraints;
pub mod load_spec;
pub mod loader;
pub mod transform;

pub use cache::{CacheKeyParts, CacheStats, CachedResult, QueryCacheKey, QueryResultCache, normalize_query};
pub use constraints::{AccessConstraint, QueryContext};
pub use load_spec::{IdSelection, LoadSpec, QueryHints, QueryText, RenderedQuery};
pub use loader::{DEFAULT_MAX_BATCH_SIZE, DataLoader, LoaderConfig};
pub use transform::{QueryParser, QueryTransformer, RegexQueryParser};
