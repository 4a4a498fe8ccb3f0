//! Approximate nearest-neighbor indexes over the embedding columns.
//!
//! Indexes are derived data: they can always be rebuilt from the store, and
//! an exact scan is always a correct fallback.

mod ivf;
mod maintainer;

pub use ivf::IvfIndex;
pub use maintainer::{BuildHandle, IndexDescriptor, IndexMaintainer, IndexState, IndexStatus};
