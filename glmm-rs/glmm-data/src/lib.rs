//! glmm-data: Input readers for glmm-rs
//!
//! Delimited data tables (numeric and categorical columns) and prior
//! tables. Everything here produces plain data; model construction
//! happens in glmm-core.

pub mod prior_file;
pub mod table;

pub use prior_file::{read_prior_table, PriorRow};
pub use table::{read_table, Column, DataTable};
