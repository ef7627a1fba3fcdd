pub mod compare;
pub mod config;
pub mod diffoscope;
pub mod error;
pub mod fetch;
pub mod history;
pub mod model;
pub mod parsers;
pub mod report;
pub mod workspace;

pub use error::{Error, Result};
