pub mod config;
pub mod eligibility;
pub mod inference;
pub mod lineage;
pub mod mask;
pub mod progress;
pub mod storage;
pub mod transform;
