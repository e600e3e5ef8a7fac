pub mod config;
pub mod research_limits;
