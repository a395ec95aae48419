mod build;
mod query;
mod teardown;

pub(crate) use build::{create, rollback};
pub(crate) use query::{history, list, status};
pub(crate) use teardown::{clean, destroy};
