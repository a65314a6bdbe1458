pub mod log;
pub mod summary;
