pub mod connection;
pub mod files;
pub mod index_runs;
pub mod keywords;
pub mod models;
pub mod previews;

pub use connection::*;
pub use models::*;
