pub mod compose;
pub mod graph;
pub mod planner;
pub mod reconcile;
pub mod script;

pub use graph::*;
pub use script::*;
