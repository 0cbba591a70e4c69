pub mod mock;
pub mod traits;

pub use mock::MockLedger;
pub use traits::{LedgerAdapter, LedgerBlock, LedgerTx, TxInput, TxOutput};
