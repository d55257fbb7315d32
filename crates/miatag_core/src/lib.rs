pub mod config;
pub mod dat;
pub mod error;
pub mod fetch;
pub mod locate;
mod markup;
pub mod mialist;
pub mod pipeline;
pub mod replace;
pub mod tagger;

pub use error::{MiaError, Result};
