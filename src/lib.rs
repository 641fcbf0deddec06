#![forbid(unsafe_code)]

pub mod assemble;
pub mod catalog;
pub mod choose;
pub mod cli;
pub mod config;
pub mod epub;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod layout;
pub mod logging;
pub mod media;
pub mod model;
pub mod pool;
pub mod reconcile;
pub mod sync;
