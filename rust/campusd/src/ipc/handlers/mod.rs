pub mod attendance;
pub mod auth;
pub mod backup_exchange;
pub mod batches;
pub mod core;
pub mod departments;
pub mod faculty;
pub mod promotion;
pub mod reports;
pub mod setup;
pub mod students;
pub mod subjects;
