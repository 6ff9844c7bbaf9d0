pub use executor::Executor;
pub use openquery::{partition_sources, Action, OpenQuery};
pub use subquery::SubQuery;
pub use translate_and_validate::{QueryDefinition, QuerySource, SourceBinding, TranslateAndValidate};

mod executor;
pub mod nulls;
mod openquery;
mod subquery;
mod translate_and_validate;
