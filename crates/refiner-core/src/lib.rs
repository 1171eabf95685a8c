pub mod config;
pub mod dataset;
pub mod engine;
pub mod errors;
pub mod events;
pub mod model;
pub mod providers;
pub mod report;
pub mod storage;
pub mod template;
