#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod csv_utils;
pub mod driver;
pub mod storage_manager;

pub use driver::MemDriver;
pub use storage_manager::StorageManager;
