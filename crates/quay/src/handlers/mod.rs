//! Built-in handlers

pub mod file_cache;
pub mod range;
pub mod static_files;
pub mod websocket;

pub use static_files::StaticFiles;
