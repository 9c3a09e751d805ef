pub mod activities;
pub mod assignments;
pub mod attendance;
pub mod backup;
pub mod classrooms;
pub mod core;
pub mod dashboard;
pub mod students;
