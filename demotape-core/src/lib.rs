pub mod cache;
pub mod cache_dir;
pub mod config;
pub mod content_type;
pub mod events;
pub mod fetch;
pub mod locator;
pub mod policy;
pub mod retry;
pub mod server;
pub mod service;
pub mod stream;
pub mod sweeper;
pub mod truncate;
