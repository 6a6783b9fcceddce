//! Sandbox backed by a local Node process. Isolation comes from the OS:
//! rlimits, Landlock, process-tree tracking and, when configured, a
//! systemd scope per run.
pub mod harness;
pub mod isolation;
pub mod sandbox;
pub mod scope;
pub mod scratch;
pub mod tree;
