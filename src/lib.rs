pub mod auth;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod error;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod service;
pub mod store;
pub mod wal;
