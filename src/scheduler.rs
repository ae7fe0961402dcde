pub mod chunk;
pub mod controller;
pub mod evaluate;
pub mod schedule;

pub use controller::JobController;
pub use evaluate::ScheduleStatus;
pub use schedule::{Backtrack, Schedule};
