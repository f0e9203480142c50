// LanceDB vector database module
// Embedded file store with one table per collection

pub mod vector_store;

pub use vector_store::LanceVectorIndex;
