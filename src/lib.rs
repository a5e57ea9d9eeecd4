pub mod classify;
pub mod config;
pub mod download;
pub mod engine;
mod error;
pub mod host;
pub mod logs;
pub mod models;
pub mod normalize;
pub mod observer;
pub mod page;
pub mod pagination;
pub mod paths;
pub mod rules;
pub mod scrape;
pub mod session;
pub mod variants;

pub use error::{EngineError, Result};
