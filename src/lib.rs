#![forbid(unsafe_code)]

pub mod analysis;
pub mod cli;
pub mod commands;
pub mod content;
pub mod course;
pub mod error;
pub mod gemini;
pub mod keys;
pub mod logging;
pub mod model;
pub mod outline;
pub mod prompt;
pub mod section;

pub use outline::parse as parse_outline;
