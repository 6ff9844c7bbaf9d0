#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod config;
pub mod grouping;
pub mod query;

pub use config::EngineConfig;
pub use query::{
    Action, Executor, OpenQuery, QueryDefinition, QuerySource, SourceBinding, SubQuery,
    TranslateAndValidate,
};
