use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

/// Columns of a snapshot table. `metadata` holds the chunk metadata as a JSON object.
pub fn snapshot_schema(dim: i32) -> Arc<Schema> {
	Arc::new(Schema::new(vec![
		Field::new("id", DataType::Utf8, false),
		Field::new("collection", DataType::Utf8, false),
		Field::new("text", DataType::Utf8, false),
		Field::new("metadata", DataType::Utf8, false),
		Field::new("content_hash", DataType::Utf8, false),
		Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
	]))
}

/// Vector width declared by a snapshot schema.
pub fn vector_dim(schema: &Schema) -> Option<usize> {
	match schema.field_with_name("vector").ok()?.data_type() {
		DataType::FixedSizeList(_, n) => usize::try_from(*n).ok(),
		_ => None,
	}
}
