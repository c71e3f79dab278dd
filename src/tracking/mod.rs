pub mod aggregator;
pub mod settlement;
