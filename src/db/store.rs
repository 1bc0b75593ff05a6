//! SQLite document store implementation.
//!
//! Each (host, service) pair owns one cached document, stored as a flat
//! dotted-path JSON object in a TEXT column. All read-modify-write
//! sequences run under the connection mutex, which is what serializes
//! concurrent updates to the same key.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::document::{flatten, unflatten};
use super::CacheError;

/// Thread-safe service cache store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with the embedded schema.
    fn init(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))?;
        Ok(())
    }

    /// Get one service document, rebuilt into its nested form.
    pub fn get_service(&self, host: &str, service: &str) -> Result<Option<Value>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM services WHERE host = ?1 AND service = ?2",
                params![host, service],
                |row| row.get(0),
            )
            .optional()?;

        match doc {
            Some(raw) => Ok(Some(parse_document(&raw, host, service)?)),
            None => Ok(None),
        }
    }

    /// Get all service documents for a host sharing one check interval.
    pub fn get_services(&self, host: &str, check_interval: f64) -> Result<Vec<Value>, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service, doc FROM services WHERE host = ?1 AND check_interval = ?2",
        )?;

        let rows = stmt
            .query_map(params![host, check_interval], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut services = Vec::with_capacity(rows.len());
        for (service, raw) in rows {
            services.push(parse_document(&raw, host, &service)?);
        }
        Ok(services)
    }

    /// Update/insert a service document, merging at leaf level.
    ///
    /// The partial document is flattened and its dotted keys overwrite
    /// the stored ones; stored keys not named by the update are
    /// preserved, and new branches may appear. Used to seed compiled
    /// specifications without clobbering runtime state.
    pub fn upsert_service(&self, host: &str, service: &str, data: &Value) -> Result<(), CacheError> {
        let new_flat = flatten(data)?.ok_or(CacheError::NotAnObject)?;

        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT doc FROM services WHERE host = ?1 AND service = ?2",
                params![host, service],
                |row| row.get(0),
            )
            .optional()?;

        let mut flat = match existing {
            Some(raw) => parse_flat(&raw, host, service)?,
            None => Map::new(),
        };
        for (key, value) in new_flat {
            flat.insert(key, value);
        }

        write_row(&conn, host, service, &flat)
    }

    /// Replace a service document outright.
    ///
    /// Unlike [`Store::upsert_service`] no merging happens: stale keys
    /// from a previous specification are dropped with the old document.
    pub fn update_service(&self, host: &str, service: &str, data: &Value) -> Result<(), CacheError> {
        let flat = flatten(data)?.ok_or(CacheError::NotAnObject)?;

        let conn = self.conn.lock().unwrap();
        write_row(&conn, host, service, &flat)
    }

    /// Record the instance id resolved for a named instance.
    ///
    /// Every service of the host that declared this instance_name gets
    /// its `instance` field updated.
    pub fn update_service_instance(
        &self,
        host: &str,
        instance_name: &str,
        instance: &Value,
    ) -> Result<usize, CacheError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service, doc FROM services WHERE host = ?1 AND instance_name = ?2",
        )?;

        let rows = stmt
            .query_map(params![host, instance_name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for (service, raw) in &rows {
            let mut flat = parse_flat(raw, host, service)?;
            flat.insert("instance".to_string(), instance.clone());
            write_row(&conn, host, service, &flat)?;
        }

        Ok(rows.len())
    }
}

/// Write one flattened document row, keeping the queryable columns in
/// sync with the document's own fields.
fn write_row(
    conn: &Connection,
    host: &str,
    service: &str,
    flat: &Map<String, Value>,
) -> Result<(), CacheError> {
    let instance_name = flat.get("instance_name").and_then(Value::as_str);
    let check_interval = flat.get("check_interval").and_then(Value::as_f64);
    let doc = serde_json::to_string(flat)?;

    conn.execute(
        "INSERT INTO services (host, service, instance_name, check_interval, doc)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(host, service) DO UPDATE SET
         instance_name=excluded.instance_name,
         check_interval=excluded.check_interval,
         doc=excluded.doc",
        params![host, service, instance_name, check_interval, doc],
    )?;
    Ok(())
}

fn parse_flat(raw: &str, host: &str, service: &str) -> Result<Map<String, Value>, CacheError> {
    let value: Value = serde_json::from_str(raw)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(CacheError::BadDocument {
            host: host.to_string(),
            service: service.to_string(),
        }),
    }
}

fn parse_document(raw: &str, host: &str, service: &str) -> Result<Value, CacheError> {
    let flat = parse_flat(raw, host, service)?;
    Ok(unflatten(&flat))
}
