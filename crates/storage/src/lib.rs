mod blob;
pub mod object;
mod registry;
pub mod retention;

pub use blob::{archive_key, discover_projects, listing_prefix, project_prefix, BlobError, BlobStore};
pub use object::{ObjectBlobStore, S3Config};
pub use registry::ProjectRegistry;
pub use retention::{prune, PruneReport};
