pub mod error;
pub mod parallel;
pub mod partial_success;
