//! Prototype aggregation: one running-mean centroid per topic/document key.
//!
//! Centroids are updated incrementally on every member add, remove and
//! reassignment, so they always equal the mean of the current members
//! without re-summing. Prototypes are cheap coarse routers in front of a
//! full nearest-neighbor search.

mod aggregator;
mod entry;
mod key;
mod rollup;

pub use aggregator::PrototypeAggregator;
pub use entry::{Prototype, PrototypeMetadata};
pub use key::PrototypeKey;
pub use rollup::{
    CatalogEntry, CoverageLink, ROLLUP_KIND, TopicRollup, catalog, coverage_links,
    plan_topic_rollups,
};
