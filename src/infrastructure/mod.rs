pub mod database;
pub mod events;
