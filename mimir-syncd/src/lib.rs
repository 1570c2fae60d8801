pub mod app;
pub mod config;
pub mod daemon;
pub mod http_api;
pub mod logging;
pub mod scheduler;
pub mod sync;
pub mod tunnel;
