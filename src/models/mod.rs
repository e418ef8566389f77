pub mod aggregation;
pub mod job;
pub mod requests;
