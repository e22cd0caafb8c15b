pub mod agent;
pub mod blocked;
pub mod config;
pub mod errors;
pub mod events;
pub mod gates;
pub mod init;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod prompt;
pub mod settings;
pub mod state;
pub mod storage;
pub mod stream;
pub mod task;
pub mod tracker;
pub mod ui;
