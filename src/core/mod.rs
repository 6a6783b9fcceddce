pub mod coordinator;
pub mod domain;
pub mod logs;
pub mod pipeline;
pub mod queue;
pub mod traits;
