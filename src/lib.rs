pub mod audit;
pub mod correction;
pub mod dsl;
pub mod error;
pub mod llm;
pub mod paths;
pub mod prompt;
pub mod settings;
pub mod storage;
