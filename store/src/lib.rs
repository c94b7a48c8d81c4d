//! An in-memory transactional [`Table`] which implements [`tc_txn::Resource`].

mod delay;
mod table;

pub use delay::{FixedDelay, NoDelay, PrepareDelay};
pub use table::Table;
