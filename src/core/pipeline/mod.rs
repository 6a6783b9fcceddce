pub mod reaping;
pub mod running;
