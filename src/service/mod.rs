//! Service specification types and the datasource compiler.
//!
//! A check command line plus the declarative datasource document compile
//! into one validated [`ServiceSpec`], the unit the cache stores and the
//! polling layer consumes.

mod args;
mod compile;

pub use args::*;
pub use compile::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::compute::DsType;

/// Configuration error types.
///
/// Any of these rejects the one service being compiled; other services
/// are unaffected.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} section is missing in the datasource files")]
    MissingSection(&'static str),
    #[error("check command cannot be parsed: {0}")]
    BadCommand(String),
    #[error("check command is too short to carry options")]
    EmptyCommand,
    #[error("unknown option {0:?} in the check command")]
    UnknownOption(String),
    #[error("option {0:?} is missing its value")]
    MissingOptionValue(String),
    #[error("option {option} has a bad value {value:?}")]
    BadOption {
        option: &'static str,
        value: String,
    },
    #[error("argument {0} is missing in the check command")]
    MissingArgument(&'static str),
    #[error("an instance must be found from a mapping table, but neither mapping nor mapping-name is set")]
    InstanceWithoutMapping,
    #[error("the maximise-datasources and maximise-datasources-value lists differ in length ({0} vs {1})")]
    OverrideLengthMismatch(usize, usize),
    #[error("mapping {0:?} is not defined in the datasource files")]
    UnknownMapping(String),
    #[error("dstemplate {0:?} is not defined in the datasource files")]
    UnknownTemplate(String),
    #[error("dstemplate {template:?} has a bad ds list: {detail}")]
    BadDsList { template: String, detail: String },
    #[error("OID for {key:?} is not valid: {value:?}")]
    BadOid { key: String, value: String },
    #[error("datasource name {0:?} is not valid (contains a hyphen)")]
    HyphenInName(String),
    #[error("datasource {0:?} is missing in the datasource files")]
    UnknownDatasource(String),
    #[error("datasource {0:?} must be a mapping of attributes")]
    BadDatasourceShape(String),
    #[error("datasource {ds_name:?} has a bad ds_type {value:?}")]
    BadDsType { ds_name: String, value: String },
    #[error("ds_oid is not defined in datasource {0:?}")]
    MissingOid(String),
    #[error("{attribute} in datasource {ds_name:?} must be a number, got {value:?}")]
    BadNumber {
        ds_name: String,
        attribute: &'static str,
        value: String,
    },
    #[error("triggergroup {0:?} has a bad format")]
    BadTriggerGroup(String),
    #[error("trigger {0:?} is not defined in the datasource files")]
    UnknownTrigger(String),
    #[error("default_status must be an integer, got {0:?}")]
    BadStatus(String),
}

/// One resolved datasource definition within a service.
///
/// Built once per compilation pass and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceDefinition {
    pub ds_name: String,
    pub ds_type: DsType,
    pub ds_oid: String,
    pub ds_max_oid: Option<String>,
    pub ds_min_oid: Option<String>,
    /// Declared bound as written in the datasource files.
    pub ds_max_oid_value: Option<Value>,
    pub ds_min_oid_value: Option<Value>,
    /// Parsed numeric form of the declared bounds.
    pub ds_max_oid_value_computed: Option<f64>,
    pub ds_min_oid_value_computed: Option<f64>,
    pub ds_calc: Option<Vec<Value>>,
    pub ds_unit: String,
}

/// One resolved trigger definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub critical: Option<Vec<Value>>,
    pub warning: Option<Vec<Value>>,
    pub default_status: i64,
}

/// A fully resolved, validated service descriptor.
///
/// Datasources keep the template's declaration order; it decides the
/// request batching order downstream.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub host: String,
    pub address: String,
    pub service: String,
    pub check_interval: f64,
    pub community: String,
    pub version: u8,
    pub port: u16,
    pub timeout: u32,
    pub retry: u32,
    pub dstemplate: String,
    pub instance: Option<String>,
    pub instance_name: Option<String>,
    /// Resolved mapping base OID, when the service uses one.
    pub mapping: Option<String>,
    pub mapping_name: Option<String>,
    pub triggergroup: Option<String>,
    pub use_getbulk: bool,
    pub max_rep_map: i64,
    pub request_group_size: i64,
    pub no_concurrency: bool,
    pub real_check: bool,
    pub datasources: Vec<(String, DatasourceDefinition)>,
    pub triggers: BTreeMap<String, TriggerDefinition>,
}

impl ServiceSpec {
    /// Look one datasource up by its template key.
    pub fn datasource(&self, name: &str) -> Option<&DatasourceDefinition> {
        self.datasources
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, ds)| ds)
    }

    /// Render the spec as the nested document the cache stores.
    ///
    /// `instance` is always written, null when unresolved, so a stale
    /// cached instance id is reset rather than carried over.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        let mut doc = Map::new();
        doc.insert("host".to_string(), Value::String(self.host.clone()));
        doc.insert("address".to_string(), Value::String(self.address.clone()));
        doc.insert("service".to_string(), Value::String(self.service.clone()));
        doc.insert("check_interval".to_string(), Value::from(self.check_interval));
        doc.insert("community".to_string(), Value::String(self.community.clone()));
        doc.insert("version".to_string(), Value::from(self.version));
        doc.insert("port".to_string(), Value::from(self.port));
        doc.insert("timeout".to_string(), Value::from(self.timeout));
        doc.insert("retry".to_string(), Value::from(self.retry));
        doc.insert(
            "dstemplate".to_string(),
            Value::String(self.dstemplate.clone()),
        );
        doc.insert("instance".to_string(), optional_string(&self.instance));
        doc.insert(
            "instance_name".to_string(),
            optional_string(&self.instance_name),
        );
        doc.insert("mapping".to_string(), optional_string(&self.mapping));
        doc.insert(
            "mapping_name".to_string(),
            optional_string(&self.mapping_name),
        );
        doc.insert(
            "triggergroup".to_string(),
            optional_string(&self.triggergroup),
        );
        doc.insert("use_getbulk".to_string(), Value::Bool(self.use_getbulk));
        doc.insert("max_rep_map".to_string(), Value::from(self.max_rep_map));
        doc.insert(
            "request_group_size".to_string(),
            Value::from(self.request_group_size),
        );
        doc.insert(
            "no_concurrency".to_string(),
            Value::Bool(self.no_concurrency),
        );
        doc.insert("real_check".to_string(), Value::Bool(self.real_check));

        let mut ds = Map::new();
        for (name, definition) in &self.datasources {
            ds.insert(name.clone(), serde_json::to_value(definition)?);
        }
        doc.insert("ds".to_string(), Value::Object(ds));

        let mut triggers = Map::new();
        for (name, trigger) in &self.triggers {
            triggers.insert(name.clone(), serde_json::to_value(trigger)?);
        }
        doc.insert("triggers".to_string(), Value::Object(triggers));

        Ok(Value::Object(doc))
    }
}

fn optional_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}
