
use arrow::array::{Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType, Table};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::vector::{
    ScoredRecord, SearchCandidate, VectorIndex, VectorRecord, assign_ids, check_dimension,
    rank_candidates, validate_collection_name,
};
use crate::{KbError, Result};

const ID_COLUMN: &str = "id";
const VECTOR_COLUMN: &str = "vector";
const METADATA_COLUMN: &str = "metadata";
const DISTANCE_COLUMN: &str = "_distance";

/// Vector index backed by an embedded LanceDB directory
pub struct LanceVectorIndex {
    connection: Connection,
}

impl LanceVectorIndex {
    /// Open (or create) the LanceDB store at `path`
    #[inline]
    pub async fn open(path: &Path) -> Result<Self> {
        debug!("Initializing LanceDB at path: {:?}", path);

        std::fs::create_dir_all(path).map_err(|e| {
            KbError::VectorBackend(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = format!("file://{}", path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to connect to LanceDB: {}", e)))?;

        info!("LanceDB vector store opened at {:?}", path);
        Ok(Self { connection })
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to list tables: {}", e)))?;
        Ok(table_names.iter().any(|table| table == name))
    }

    /// Open a collection's table, reporting a missing one as `NotFound`
    async fn open_collection(&self, name: &str) -> Result<Table> {
        validate_collection_name(name)?;
        if !self.table_exists(name).await? {
            return Err(KbError::NotFound(format!("Collection '{}'", name)));
        }
        self.connection
            .open_table(name)
            .execute()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to open table '{}': {}", name, e)))
    }

    /// Declared vector dimension of an existing table
    async fn table_dimension(table: &Table) -> Result<usize> {
        let schema = table
            .schema()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to get table schema: {}", e)))?;
        vector_dimension(&schema).ok_or_else(|| {
            KbError::VectorBackend(format!(
                "Table '{}' has no fixed-size vector column",
                table.name()
            ))
        })
    }
}

/// Schema of every collection table
pub(crate) fn collection_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(ID_COLUMN, DataType::Utf8, false),
        Field::new(
            VECTOR_COLUMN,
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ),
        Field::new(METADATA_COLUMN, DataType::Utf8, false),
    ]))
}

pub(crate) fn vector_dimension(schema: &Schema) -> Option<usize> {
    schema
        .field_with_name(VECTOR_COLUMN)
        .ok()
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
}

/// Build one Arrow batch from `(id, record)` pairs
pub(crate) fn build_record_batch(
    dimension: usize,
    records: &[(String, VectorRecord)],
) -> Result<RecordBatch> {
    let mut ids = Vec::with_capacity(records.len());
    let mut flat_values = Vec::with_capacity(records.len() * dimension);
    let mut metadata = Vec::with_capacity(records.len());

    for (id, record) in records {
        ids.push(id.as_str());
        flat_values.extend_from_slice(&record.vector);
        let json = serde_json::to_string(&record.metadata)
            .map_err(|e| KbError::VectorBackend(format!("Failed to encode metadata: {}", e)))?;
        metadata.push(json);
    }

    let schema = collection_schema(dimension);
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let vector_array = FixedSizeListArray::try_new(
        field,
        dimension as i32,
        Arc::new(Float32Array::from(flat_values)),
        None,
    )
    .map_err(|e| KbError::VectorBackend(format!("Failed to create vector array: {}", e)))?;

    let arrays: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(ids)),
        Arc::new(vector_array),
        Arc::new(StringArray::from(metadata)),
    ];

    RecordBatch::try_new(schema, arrays)
        .map_err(|e| KbError::VectorBackend(format!("Failed to create record batch: {}", e)))
}

/// Read `(id, distance, metadata)` rows out of a search result batch
pub(crate) fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<SearchCandidate>> {
    let ids = string_column(batch, ID_COLUMN)?;
    let metadata = string_column(batch, METADATA_COLUMN)?;
    let distances = batch
        .column_by_name(DISTANCE_COLUMN)
        .and_then(|col| col.as_any().downcast_ref::<Float32Array>());

    (0..batch.num_rows())
        .map(|row| {
            let metadata: Map<String, Value> = serde_json::from_str(metadata.value(row))
                .map_err(|e| {
                    KbError::VectorBackend(format!("Stored metadata is not a JSON object: {}", e))
                })?;
            let distance = distances.and_then(|d| (!d.is_null(row)).then(|| d.value(row)));
            Ok(SearchCandidate {
                id: ids.value(row).to_string(),
                distance,
                metadata,
            })
        })
        .collect()
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .ok_or_else(|| KbError::VectorBackend(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| KbError::VectorBackend(format!("Invalid {} column type", name)))
}

fn id_predicate(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("'{}'", id.replace('\'', "''")))
        .collect();
    format!("{} IN ({})", ID_COLUMN, quoted.join(", "))
}

/// Keep only the last record for each id, in first-seen order
fn dedupe_last_wins(records: Vec<(String, VectorRecord)>) -> Vec<(String, VectorRecord)> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<(String, VectorRecord)> = Vec::with_capacity(records.len());
    for (id, record) in records {
        if let Some(&index) = positions.get(&id) {
            unique[index].1 = record;
        } else {
            positions.insert(id.clone(), unique.len());
            unique.push((id, record));
        }
    }
    unique
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    #[inline]
    fn backend_name(&self) -> &'static str {
        "lancedb"
    }

    async fn create_or_get_collection(&self, name: &str, dimension: usize) -> Result<()> {
        validate_collection_name(name)?;
        if dimension == 0 {
            return Err(KbError::Validation(
                "Collection dimension must be greater than 0".to_string(),
            ));
        }

        if !self.table_exists(name).await? {
            info!("Creating collection '{}' with {} dimensions", name, dimension);
            let created = self
                .connection
                .create_empty_table(name, collection_schema(dimension))
                .execute()
                .await;
            // A concurrent creator may have won the race; the table is checked below
            if let Err(e) = created {
                if !self.table_exists(name).await? {
                    return Err(KbError::VectorBackend(format!(
                        "Failed to create table '{}': {}",
                        name, e
                    )));
                }
            } else {
                return Ok(());
            }
        }

        let table = self.open_collection(name).await?;
        let existing = Self::table_dimension(&table).await?;
        if existing != dimension {
            return Err(KbError::VectorBackend(format!(
                "Collection '{}' exists with {} dimensions, requested {}",
                name, existing, dimension
            )));
        }
        debug!("Collection '{}' already exists", name);
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        validate_collection_name(name)?;
        self.table_exists(name).await
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<Vec<String>> {
        let table = self.open_collection(collection).await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let dimension = Self::table_dimension(&table).await?;
        for record in &records {
            check_dimension(collection, dimension, record.vector.len())?;
        }

        let assigned = assign_ids(records);
        let ids: Vec<String> = assigned.iter().map(|(id, _)| id.clone()).collect();
        let unique = dedupe_last_wins(assigned);
        let unique_ids: Vec<String> = unique.iter().map(|(id, _)| id.clone()).collect();

        table
            .delete(&id_predicate(&unique_ids))
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to replace records: {}", e)))?;

        let batch = build_record_batch(dimension, &unique)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to insert records: {}", e)))?;

        debug!("Upserted {} records into '{}'", unique.len(), collection);
        Ok(ids)
    }

    async fn similarity_search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let table = self.open_collection(collection).await?;
        let dimension = Self::table_dimension(&table).await?;
        check_dimension(collection, dimension, query.len())?;

        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = table
            .count_rows(None)
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to count rows: {}", e)))?;
        if rows == 0 {
            return Ok(Vec::new());
        }

        let mut results = table
            .vector_search(query)
            .map_err(|e| KbError::VectorBackend(format!("Failed to create vector search: {}", e)))?
            .column(VECTOR_COLUMN)
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to execute search: {}", e)))?;

        let mut candidates = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to read result stream: {}", e)))?
        {
            candidates.extend(parse_search_batch(&batch)?);
        }

        debug!(
            "LanceDB returned {} candidates from '{}'",
            candidates.len(),
            collection
        );
        Ok(rank_candidates(candidates, k, threshold))
    }

    async fn delete_records(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() || !self.has_collection(collection).await? {
            return Ok(());
        }
        let table = self.open_collection(collection).await?;
        table
            .delete(&id_predicate(ids))
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to delete records: {}", e)))?;
        debug!("Deleted {} records from '{}'", ids.len(), collection);
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let table = self.open_collection(collection).await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to count rows: {}", e)))
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        if !self.has_collection(name).await? {
            debug!("Collection '{}' already absent", name);
            return Ok(());
        }
        info!("Dropping collection '{}'", name);
        self.connection
            .drop_table(name)
            .await
            .map_err(|e| KbError::VectorBackend(format!("Failed to drop table: {}", e)))
    }
}
