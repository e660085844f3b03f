pub mod evaluate;
pub mod ground_truth;
pub mod status;
