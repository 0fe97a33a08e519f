pub mod catalog_store;
pub mod keyforge;
pub mod memory_store;
