//! Shared data model, execution engine and error taxonomy for the QNet node.

mod block;
mod economics;
mod error;
mod state;
mod transaction;
mod types;

pub use block::{merkle_root, Block, BlockHeader};
pub use economics::TokenEconomics;
pub use error::{QNetError, QNetResult};
pub use state::{ChainState, CryptoProvider, ExecutionEngine};
pub use transaction::{Transaction, TxKind};
pub use types::{
    address_from_string, address_to_string, now_ms, Address, BlockHash, NodeId, Recipient,
    SystemPrincipal, TxHash, ZERO_ADDRESS,
};
