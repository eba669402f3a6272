pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod images;
pub mod node;
pub mod runtime;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod vault;
pub mod worker;
