pub mod export;
pub mod generator;
pub mod llm;
pub mod persistence;
pub mod retry;
pub mod workflow;
