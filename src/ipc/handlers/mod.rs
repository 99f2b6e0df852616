pub mod attendance;
pub mod auth;
pub mod backup;
pub mod content;
pub mod core;
pub mod marks;
pub mod reports;
pub mod students;
