pub mod indexer;
pub mod scanner;

pub use indexer::{Indexer, IndexerConfig, IndexerMetrics};
pub use scanner::{MatchedTx, PrefixFilter, PrefixMatchMode, Scanner, ScannerConfig};
