pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod mapper;
pub mod orchestrator;
pub mod source;
pub mod store;
pub mod tenant;
pub mod types;
pub mod upsert;
