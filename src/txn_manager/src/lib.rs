#[macro_use]
extern crate log;

pub mod registry;

pub use registry::TransactionRegistry;
