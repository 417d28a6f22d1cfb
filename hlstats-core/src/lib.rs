//! hlstats core: datasets, partitions, payload parsing, transforms, table store.
//!
//! This crate holds everything a single partition touches on its way from the
//! object store into the cache tables:
//! - Dataset registry (table-driven descriptors for every supported dataset)
//! - Partition enumeration (flat daily and lazy date × hour × asset plans)
//! - Object fetching, LZ4 decompression and the asset catalog
//! - Raw payload parsing (delimited tables and order-book snapshot streams)
//! - Feature transforms (polars group-by aggregation, liquidity and slippage)
//! - Table store, watermark tracking and the cache aggregator

pub mod aggregator;
pub mod data;
pub mod dataset;
pub mod partition;
pub mod records;
pub mod store;
pub mod transform;
pub mod watermark;

pub use aggregator::CacheAggregator;
pub use dataset::{Dataset, DatasetRegistry, PartitionScheme, TransformSpec};
pub use partition::{Partition, PartitionPlan};
pub use records::{CacheRow, KeyValue, RawTable};
pub use watermark::WatermarkTracker;

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything the runner shares across rayon workers
    /// is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<Dataset>();
        require_sync::<Dataset>();
        require_send::<Partition>();
        require_sync::<Partition>();
        require_send::<PartitionPlan>();
        require_sync::<PartitionPlan>();
        require_send::<RawTable>();
        require_sync::<RawTable>();
        require_send::<CacheRow>();
        require_sync::<CacheRow>();
        require_send::<data::orderbook::OrderBookSnapshot>();
        require_sync::<data::orderbook::OrderBookSnapshot>();
        require_send::<transform::orderbook::SnapshotMetrics>();
        require_sync::<transform::orderbook::SnapshotMetrics>();
        require_send::<store::SqliteStore>();
        require_sync::<store::SqliteStore>();
    }

    /// The boundary traits are object safe and shareable across worker threads.
    #[test]
    fn boundary_trait_objects_are_send_sync() {
        fn require_send_sync<T: Send + Sync + ?Sized>() {}

        require_send_sync::<dyn data::ObjectFetcher>();
        require_send_sync::<dyn data::AssetCatalog>();
        require_send_sync::<dyn store::TableStore>();
    }
}
