pub mod errors;
pub mod events;
pub mod models;
pub mod record;
pub mod scheduler;
pub mod scope;
pub mod state;
pub mod target;
