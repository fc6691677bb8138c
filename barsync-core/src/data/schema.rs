use polars::prelude::*;

/// Column names of a candle partition, in file order.
pub const CANDLE_COLUMNS: [&str; 6] = ["time", "open", "high", "low", "close", "volume"];

/// Expected schema for candle partitions.
///
/// Prices and volume are stored as decimal strings so that values read back
/// compare exactly with what the API returned.
pub struct CandleSchema;

impl CandleSchema {
    /// Get the canonical candle schema
    pub fn schema() -> Schema {
        Schema::from_iter(vec![
            Field::new("time".into(), DataType::Datetime(TimeUnit::Milliseconds, None)),
            Field::new("open".into(), DataType::String),
            Field::new("high".into(), DataType::String),
            Field::new("low".into(), DataType::String),
            Field::new("close".into(), DataType::String),
            Field::new("volume".into(), DataType::String),
        ])
    }

    /// Validate DataFrame against schema
    pub fn validate(df: &DataFrame) -> Result<(), SchemaError> {
        let expected = Self::schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },
}
