//! Long-running worker loops.
//!
//! Each worker takes its options, its collaborators, a sleep function and a
//! shutdown signal; the supervisor in `app::run` owns spawning and joining.

pub mod commandstream;
pub mod controller;
pub mod imagewatcher;
pub mod livestate;
pub mod statreporter;
pub mod trigger;
