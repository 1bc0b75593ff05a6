//! Per-cycle processing of collected readings.
//!
//! The transport that samples devices is external; it hands over
//! batches of raw readings. Each reading is computed against the cached
//! previous sample for its datasource, and the new state is folded back
//! into the cache for the next cycle. One bad reading never aborts the
//! rest of the batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::compute::{
    compute_value, ComputeError, ComputedValue, DsType, RawValue, ReadingContext,
};
use crate::db::{merge, CacheError, Store};

/// One raw sampled value for one datasource of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub host: String,
    pub service: String,
    pub ds_name: String,
    pub value: RawValue,
    pub check_time: f64,
}

/// Collection error types.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("service is not in the cache")]
    UnknownService,
    #[error("datasource is not in the cached specification")]
    UnknownDatasource,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
    #[error("state encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome counters for one processed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    /// Readings that produced a computed value.
    pub computed: usize,
    /// Rate readings parked until one more sample arrives.
    pub waiting: usize,
    /// Readings dropped with a logged error.
    pub failed: usize,
}

/// Process one batch of readings against the cache.
pub fn process_readings(store: &Store, readings: &[Reading]) -> CycleSummary {
    let mut summary = CycleSummary::default();

    for reading in readings {
        match process_reading(store, reading) {
            Ok(Some(value)) => {
                tracing::debug!(
                    "Collect: [{}, {}] {} = {}",
                    reading.host,
                    reading.service,
                    reading.ds_name,
                    value.to_text()
                );
                summary.computed += 1;
            }
            Ok(None) => summary.waiting += 1,
            Err(e) => {
                tracing::error!(
                    "Collect: [{}, {}] {}: {}",
                    reading.host,
                    reading.service,
                    reading.ds_name,
                    e
                );
                summary.failed += 1;
            }
        }
    }

    summary
}

/// Compute one reading and persist its state.
///
/// Returns the computed value, or `None` when the datasource needs one
/// more sample; in both cases the raw sample is stored as the previous
/// value for the next cycle.
fn process_reading(
    store: &Store,
    reading: &Reading,
) -> Result<Option<ComputedValue>, CollectError> {
    let doc = store
        .get_service(&reading.host, &reading.service)?
        .ok_or(CollectError::UnknownService)?;
    let ds = doc
        .get("ds")
        .and_then(|section| section.get(&reading.ds_name))
        .and_then(Value::as_object)
        .ok_or(CollectError::UnknownDatasource)?;

    let ds_type_raw = ds.get("ds_type").and_then(Value::as_str).unwrap_or("TEXT");
    let ds_type = DsType::parse(ds_type_raw)
        .ok_or_else(|| ComputeError::UnknownType(ds_type_raw.to_string()))?;

    let ctx = ReadingContext {
        ds_type,
        value: reading.value.clone(),
        check_time: reading.check_time,
        last_value: field(ds, "last_value"),
        last_check_time: ds.get("last_check_time").and_then(Value::as_f64),
        last_computed: field(ds, "last_computed"),
        calc: match ds.get("ds_calc") {
            Some(Value::Array(tokens)) => Some(tokens.clone()),
            _ => None,
        },
        max_value: ds.get("ds_max_oid_value_computed").and_then(Value::as_f64),
        min_value: ds.get("ds_min_oid_value_computed").and_then(Value::as_f64),
    };

    let computed = match compute_value(&ctx) {
        Ok(value) => Some(value),
        Err(e) if e.is_transient() => {
            tracing::debug!(
                "Collect: [{}, {}] {}: {}",
                reading.host,
                reading.service,
                reading.ds_name,
                e
            );
            None
        }
        Err(e) => return Err(e.into()),
    };

    let mut state = Map::new();
    state.insert(
        "last_value".to_string(),
        serde_json::to_value(&reading.value)?,
    );
    state.insert("last_check_time".to_string(), Value::from(reading.check_time));
    if let Some(value) = &computed {
        state.insert("last_computed".to_string(), serde_json::to_value(value)?);
    }

    let mut ds_section = Map::new();
    ds_section.insert(reading.ds_name.clone(), Value::Object(state));
    let mut update = Map::new();
    update.insert("ds".to_string(), Value::Object(ds_section));

    // Fold the cycle state into the document we already hold, then
    // write the whole merged document back
    let merged = merge(Some(&doc), Some(&Value::Object(update)))?;
    store.update_service(&reading.host, &reading.service, &merged)?;

    Ok(computed)
}

fn field<T: serde::de::DeserializeOwned>(ds: &Map<String, Value>, name: &str) -> Option<T> {
    ds.get(name)
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
