//! Model description and fitted-model operations.

pub mod fitted;
pub mod formula;
pub mod frame;
pub mod parameters;
pub mod predict;
pub mod serialization;
pub mod simulate;
pub mod spec;
