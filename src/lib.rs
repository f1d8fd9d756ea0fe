pub mod api;
pub mod app;
pub mod config;
pub mod cookies;
pub mod dates;
pub mod domain;
pub mod extract;
pub mod feed;
pub mod infrastructure;
pub mod limiter;
pub mod queue;
pub mod worker;
