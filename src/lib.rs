pub mod config;
pub mod coordination;
pub mod db;
pub mod jobs;
pub mod keywords;
pub mod metadata_extractor;
pub mod mimetype_detector;
pub mod preview_renderer;
pub mod scheduler;
pub mod search;
pub mod search_parser;
