pub mod aggregation;
pub mod clustering;
pub mod embedding;
pub mod executor;
pub mod queue;
pub mod segmentation;
pub mod storage;
pub mod worker;
