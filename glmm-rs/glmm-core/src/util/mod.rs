pub mod ad;
pub mod math;
