pub mod config;
pub mod frame;
pub mod geometry;
pub mod map;
pub mod matcher;
pub mod vocabulary;

#[cfg(test)]
mod test_support;

pub use config::MatcherConfig;
pub use matcher::{FuseOutcome, OrbMatcher};
