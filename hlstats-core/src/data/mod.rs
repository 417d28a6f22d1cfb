//! Data access: object fetching, asset catalog and payload parsing.

pub mod catalog;
pub mod circuit_breaker;
pub mod fetch;
pub mod loader;
pub mod orderbook;
pub mod s3;

pub use catalog::{AssetCatalog, CatalogError, HttpAssetCatalog, StaticAssetCatalog};
pub use circuit_breaker::CircuitBreaker;
pub use fetch::{decompress_lz4, payload_digest, FetchError, LocalObjectFetcher, ObjectFetcher};
pub use loader::{LoadError, RawLoader};
pub use orderbook::{parse_snapshots, Level, OrderBookSnapshot};
pub use s3::{S3Credentials, S3ObjectFetcher, S3Settings};
