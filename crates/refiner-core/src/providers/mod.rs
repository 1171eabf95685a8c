pub mod llm;
pub mod registry;
