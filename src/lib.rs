pub mod actors;
pub mod config;
pub mod error;
pub mod expressions;
pub mod insights;
pub mod progress;
pub mod rules;
pub mod storage;
pub mod timeseries;
pub mod twins;
