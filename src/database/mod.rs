// Database module
// SQLite for knowledge-base metadata and chat state, a pluggable vector index for embeddings

pub mod lancedb;
pub mod milvus;
pub mod sqlite;
pub mod vector;

pub use sqlite::*;
pub use vector::{
    ChunkMetadata, ScoredRecord, VectorIndex, VectorIndexHandle, VectorRecord,
    collection_name_for, connect_vector_index, distance_to_similarity,
};
