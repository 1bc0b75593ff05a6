//! Datasource document compiler.
//!
//! Resolves the declarative datasource document (MAP / DSTEMPLATE /
//! DATASOURCE / TRIGGERGROUP / TRIGGER sections) against one check's
//! resolved options into a validated [`ServiceSpec`](super::ServiceSpec).
//! Every resolution step fails hard; a rejected service never reaches
//! the cache half-built.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::{CheckArgs, ConfigError, DatasourceDefinition, ServiceSpec, TriggerDefinition};
use crate::compute::DsType;

fn oid_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\.\d+(\.\d+)*").unwrap())
}

/// Compile one service specification.
pub fn compile(
    args: &CheckArgs,
    datasource: &Value,
    check_interval: f64,
) -> Result<ServiceSpec, ConfigError> {
    // All four declarative sections must be present before anything else
    let map_section = section(datasource, "MAP")?;
    let template_section = section(datasource, "DSTEMPLATE")?;
    let datasource_section = section(datasource, "DATASOURCE")?;
    let triggergroup_section = section(datasource, "TRIGGERGROUP")?;

    // An instance name is resolved through a mapping table; without one
    // there is nothing to resolve it against
    if args.instance_name.is_some() && args.mapping.is_none() && args.mapping_name.is_none() {
        return Err(ConfigError::InstanceWithoutMapping);
    }

    let mapping = resolve_mapping(args, map_section)?;

    // A mapped instance name means the instance id must be re-derived,
    // not carried over from a previous resolution
    let instance = if args.instance_name.is_some() && mapping.is_some() {
        None
    } else {
        args.instance.clone()
    };

    let ds_list = resolve_ds_list(&args.dstemplate, template_section)?;

    validate_datasource_section(datasource_section)?;

    let default_ds_type = datasource_section
        .get("ds_type")
        .and_then(Value::as_str)
        .unwrap_or("TEXT");
    let default_min_value = datasource_section
        .get("ds_min_oid_value")
        .filter(|v| !v.is_null());

    let mut datasources = Vec::with_capacity(ds_list.len());
    for ds_name in &ds_list {
        let ds_data = match datasource_section.get(ds_name) {
            Some(Value::Object(data)) => data,
            Some(Value::Null) | None => return Err(ConfigError::UnknownDatasource(ds_name.clone())),
            Some(_) => return Err(ConfigError::BadDatasourceShape(ds_name.clone())),
        };
        let definition = build_datasource(
            ds_name,
            ds_data,
            default_ds_type,
            default_min_value,
            args,
        )?;
        datasources.push((ds_name.clone(), definition));
    }

    let triggers = resolve_triggers(args, datasource, triggergroup_section)?;

    Ok(ServiceSpec {
        host: args.host.clone(),
        address: args.address.clone(),
        service: args.service.clone(),
        check_interval,
        community: args.community.clone(),
        version: args.version,
        port: args.port,
        timeout: args.timeout,
        retry: args.retry,
        dstemplate: args.dstemplate.clone(),
        instance,
        instance_name: args.instance_name.clone(),
        mapping,
        mapping_name: args.mapping_name.clone(),
        triggergroup: args.triggergroup.clone(),
        use_getbulk: args.use_getbulk,
        max_rep_map: args.max_rep_map,
        request_group_size: args.request_group_size,
        no_concurrency: args.no_concurrency,
        real_check: args.real_check,
        datasources,
        triggers,
    })
}

fn section<'a>(
    datasource: &'a Value,
    name: &'static str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    datasource
        .get(name)
        .and_then(Value::as_object)
        .ok_or(ConfigError::MissingSection(name))
}

/// A named mapping resolves to its table entry's base OID; a literal
/// mapping passes through as given.
fn resolve_mapping(
    args: &CheckArgs,
    map_section: &Map<String, Value>,
) -> Result<Option<String>, ConfigError> {
    match &args.mapping_name {
        Some(name) => {
            let base_oid = map_section
                .get(name)
                .and_then(|entry| entry.get("base_oid"))
                .and_then(Value::as_str)
                .ok_or_else(|| ConfigError::UnknownMapping(name.clone()))?;
            Ok(Some(base_oid.to_string()))
        }
        None => Ok(args.mapping.clone()),
    }
}

/// The template's `ds` member lists the datasources to include, either
/// literally or as one comma-separated string.
fn resolve_ds_list(
    template_name: &str,
    template_section: &Map<String, Value>,
) -> Result<Vec<String>, ConfigError> {
    let template = match template_section.get(template_name) {
        Some(entry) if !entry.is_null() => entry,
        _ => return Err(ConfigError::UnknownTemplate(template_name.to_string())),
    };

    let ds_member = template.get("ds").ok_or_else(|| ConfigError::BadDsList {
        template: template_name.to_string(),
        detail: "no ds member".to_string(),
    })?;

    match ds_member {
        Value::String(list) => Ok(list
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect()),
        Value::Array(items) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(name) => names.push(name.trim().to_string()),
                    None => {
                        return Err(ConfigError::BadDsList {
                            template: template_name.to_string(),
                            detail: format!("bad entry {}", item),
                        })
                    }
                }
            }
            Ok(names)
        }
        other => Err(ConfigError::BadDsList {
            template: template_name.to_string(),
            detail: format!("bad format {}", other),
        }),
    }
}

/// Attributes directly under DATASOURCE are either control attributes
/// (ds-prefixed), OID strings, or nested datasource declarations whose
/// keys must stay hyphen-free.
fn validate_datasource_section(datasource_section: &Map<String, Value>) -> Result<(), ConfigError> {
    for (key, value) in datasource_section {
        match value {
            Value::String(text) => {
                if !oid_regex().is_match(text) && !key.starts_with("ds") {
                    return Err(ConfigError::BadOid {
                        key: key.clone(),
                        value: text.clone(),
                    });
                }
            }
            Value::Object(_) => {
                if key.contains('-') {
                    return Err(ConfigError::HyphenInName(key.clone()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn build_datasource(
    ds_name: &str,
    ds_data: &Map<String, Value>,
    default_ds_type: &str,
    default_min_value: Option<&Value>,
    args: &CheckArgs,
) -> Result<DatasourceDefinition, ConfigError> {
    let name = ds_data
        .get("ds_name")
        .and_then(Value::as_str)
        .unwrap_or(ds_name)
        .to_string();

    let ds_type_raw = ds_data
        .get("ds_type")
        .and_then(Value::as_str)
        .unwrap_or(default_ds_type);
    let ds_type = DsType::parse(ds_type_raw).ok_or_else(|| ConfigError::BadDsType {
        ds_name: ds_name.to_string(),
        value: ds_type_raw.to_string(),
    })?;

    let ds_oid = ds_data
        .get("ds_oid")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::MissingOid(ds_name.to_string()))?
        .to_string();

    let mut ds_max_oid = optional_text(ds_data.get("ds_max_oid"));
    let ds_min_oid = optional_text(ds_data.get("ds_min_oid"));

    let mut ds_max_oid_value = ds_data.get("ds_max_oid_value").filter(|v| !v.is_null()).cloned();
    let ds_min_oid_value = ds_data
        .get("ds_min_oid_value")
        .filter(|v| !v.is_null())
        .or(default_min_value)
        .cloned();

    // A maximum supplied on the command line replaces any polled maximum
    if let Some(value) = args.max_overrides.get(ds_name) {
        ds_max_oid = None;
        ds_max_oid_value = Some(Value::String(value.clone()));
    }

    let ds_max_oid_value_computed = parse_bound(ds_name, "ds_max_oid_value", &ds_max_oid_value)?;
    let ds_min_oid_value_computed = parse_bound(ds_name, "ds_min_oid_value", &ds_min_oid_value)?;

    let ds_calc = match ds_data.get("ds_calc") {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(items.clone()),
        Some(Value::String(list)) => Some(
            list.split(',')
                .map(|token| Value::String(token.trim().to_string()))
                .collect(),
        ),
        Some(other) => Some(vec![other.clone()]),
    };

    let ds_unit = ds_data
        .get("ds_unit")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    Ok(DatasourceDefinition {
        ds_name: name,
        ds_type,
        ds_oid,
        ds_max_oid,
        ds_min_oid,
        ds_max_oid_value,
        ds_min_oid_value,
        ds_max_oid_value_computed,
        ds_min_oid_value_computed,
        ds_calc,
        ds_unit,
    })
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn parse_bound(
    ds_name: &str,
    attribute: &'static str,
    value: &Option<Value>,
) -> Result<Option<f64>, ConfigError> {
    match value {
        None => Ok(None),
        Some(raw) => match parse_number(raw) {
            Some(parsed) => Ok(Some(parsed)),
            None => Err(ConfigError::BadNumber {
                ds_name: ds_name.to_string(),
                attribute,
                value: raw.to_string(),
            }),
        },
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Resolve the trigger group named by the check, if any.
///
/// An unknown group name compiles to an empty trigger map; a missing
/// TRIGGER section or a missing named trigger is an error.
fn resolve_triggers(
    args: &CheckArgs,
    datasource: &Value,
    triggergroup_section: &Map<String, Value>,
) -> Result<BTreeMap<String, TriggerDefinition>, ConfigError> {
    let mut triggers = BTreeMap::new();

    let group_name = match &args.triggergroup {
        Some(name) => name,
        None => return Ok(triggers),
    };
    let group = match triggergroup_section.get(group_name) {
        Some(entry) if !entry.is_null() => entry,
        _ => return Ok(triggers),
    };

    let trigger_names: Vec<String> = match group {
        Value::String(name) => vec![name.clone()],
        Value::Array(items) => {
            let mut names = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(name) => names.push(name.to_string()),
                    None => return Err(ConfigError::BadTriggerGroup(group_name.clone())),
                }
            }
            names
        }
        _ => return Err(ConfigError::BadTriggerGroup(group_name.clone())),
    };

    let trigger_section = section(datasource, "TRIGGER")?;
    let group_default_status = match trigger_section.get("default_status") {
        Some(value) => parse_status(value)?,
        None => 3,
    };

    for trigger_name in trigger_names {
        let trigger_data = match trigger_section.get(&trigger_name) {
            Some(Value::Object(data)) => data,
            _ => return Err(ConfigError::UnknownTrigger(trigger_name)),
        };

        let default_status = match trigger_data.get("default_status") {
            Some(value) => parse_status(value)?,
            None => group_default_status,
        };

        triggers.insert(
            trigger_name,
            TriggerDefinition {
                critical: trigger_list(trigger_data.get("critical")),
                warning: trigger_list(trigger_data.get("warning")),
                default_status,
            },
        );
    }

    Ok(triggers)
}

fn trigger_list(value: Option<&Value>) -> Option<Vec<Value>> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(items.clone()),
        Some(other) => Some(vec![other.clone()]),
    }
}

fn parse_status(value: &Value) -> Result<i64, ConfigError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| ConfigError::BadStatus(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadStatus(s.clone())),
        other => Err(ConfigError::BadStatus(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_datasource() -> Value {
        json!({
            "MAP": {
                "interface": {"base_oid": ".1.3.6.1.2.1.2.2.1.2"}
            },
            "DSTEMPLATE": {
                "standard-interface": {"ds": ["ifInOctets", "ifOutOctets"]},
                "compact-interface": {"ds": "ifInOctets, ifOutOctets"},
                "broken-interface": {"ds": ["ifInOctets", "ifMissing"]},
                "no-oid": {"ds": ["ifNoOid"]}
            },
            "DATASOURCE": {
                "ds_type": "DERIVE",
                "ds_min_oid_value": 0,
                "ifInOctets": {
                    "ds_oid": ".1.3.6.1.2.1.2.2.1.10",
                    "ds_max_oid": ".1.3.6.1.2.1.2.2.1.5",
                    "ds_calc": [8, "mul"],
                    "ds_unit": "b/s"
                },
                "ifOutOctets": {
                    "ds_oid": ".1.3.6.1.2.1.2.2.1.16",
                    "ds_type": "DERIVE64"
                },
                "ifNoOid": {
                    "ds_unit": "b/s"
                }
            },
            "TRIGGERGROUP": {
                "if_errors": ["error_rate"],
                "if_single": "error_rate"
            },
            "TRIGGER": {
                "default_status": 2,
                "error_rate": {
                    "critical": ["ifInOctets", "50", "gt"],
                    "default_status": 3
                },
                "bare_trigger": {}
            }
        })
    }

    fn sample_args(extra: &[(&str, &str)]) -> CheckArgs {
        let mut options = vec![
            ("host".to_string(), "myhost1".to_string()),
            ("address".to_string(), "192.168.1.5".to_string()),
            ("service".to_string(), "if.eth0".to_string()),
            ("dstemplate".to_string(), "standard-interface".to_string()),
        ];
        for (name, value) in extra {
            options.push((name.to_string(), value.to_string()));
        }
        CheckArgs::from_options(&options).unwrap()
    }

    #[test]
    fn test_compile_resolves_datasources_in_order() {
        let spec = compile(&sample_args(&[]), &sample_datasource(), 60.0).unwrap();

        let names: Vec<&str> = spec
            .datasources
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["ifInOctets", "ifOutOctets"]);

        let ds = spec.datasource("ifInOctets").unwrap();
        assert_eq!(ds.ds_oid, ".1.3.6.1.2.1.2.2.1.10");
        assert_eq!(ds.ds_type, DsType::Derive);
        assert_eq!(ds.ds_unit, "b/s");
        assert_eq!(ds.ds_calc.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_compile_applies_section_defaults() {
        let spec = compile(&sample_args(&[]), &sample_datasource(), 60.0).unwrap();

        let ds = spec.datasource("ifOutOctets").unwrap();
        assert_eq!(ds.ds_type, DsType::Derive64);
        assert_eq!(ds.ds_name, "ifOutOctets");
        assert_eq!(ds.ds_unit, "");
        assert!(ds.ds_calc.is_none());
        assert!(ds.ds_max_oid.is_none());
        // section-level minimum is inherited and parsed
        assert_eq!(ds.ds_min_oid_value, Some(json!(0)));
        assert_eq!(ds.ds_min_oid_value_computed, Some(0.0));
    }

    #[test]
    fn test_compile_comma_separated_ds_list() {
        let args = sample_args(&[("dstemplate", "compact-interface")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert_eq!(spec.datasources.len(), 2);
    }

    #[test]
    fn test_compile_missing_section() {
        let mut doc = sample_datasource();
        doc.as_object_mut().unwrap().remove("TRIGGERGROUP");

        let err = compile(&sample_args(&[]), &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("TRIGGERGROUP")));
    }

    #[test]
    fn test_compile_unknown_template() {
        let args = sample_args(&[("dstemplate", "no-such-template")]);
        let err = compile(&args, &sample_datasource(), 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTemplate(_)));
    }

    #[test]
    fn test_compile_unknown_datasource() {
        let args = sample_args(&[("dstemplate", "broken-interface")]);
        let err = compile(&args, &sample_datasource(), 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDatasource(name) if name == "ifMissing"));
    }

    #[test]
    fn test_compile_missing_oid() {
        let args = sample_args(&[("dstemplate", "no-oid")]);
        let err = compile(&args, &sample_datasource(), 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::MissingOid(name) if name == "ifNoOid"));
    }

    #[test]
    fn test_compile_mapping_name_resolution() {
        let args = sample_args(&[("mapping-name", "interface"), ("instance-name", "eth0")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert_eq!(spec.mapping.as_deref(), Some(".1.3.6.1.2.1.2.2.1.2"));
    }

    #[test]
    fn test_compile_unknown_mapping_name() {
        let args = sample_args(&[("mapping-name", "no-such-map")]);
        let err = compile(&args, &sample_datasource(), 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMapping(_)));
    }

    #[test]
    fn test_compile_instance_needs_mapping() {
        let args = sample_args(&[("instance-name", "eth0")]);
        let err = compile(&args, &sample_datasource(), 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::InstanceWithoutMapping));
    }

    #[test]
    fn test_compile_discards_instance_when_mapped() {
        let args = sample_args(&[
            ("instance-name", "eth0"),
            ("mapping-name", "interface"),
            ("instance", "3"),
        ]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert!(spec.instance.is_none());
    }

    #[test]
    fn test_compile_keeps_literal_instance_without_mapping() {
        let args = sample_args(&[("instance", "3")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert_eq!(spec.instance.as_deref(), Some("3"));
    }

    #[test]
    fn test_compile_max_override_replaces_oid() {
        let args = sample_args(&[
            ("maximise-datasources", "ifInOctets"),
            ("maximise-datasources-value", "1000000"),
        ]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();

        let ds = spec.datasource("ifInOctets").unwrap();
        assert!(ds.ds_max_oid.is_none());
        assert_eq!(ds.ds_max_oid_value, Some(json!("1000000")));
        assert_eq!(ds.ds_max_oid_value_computed, Some(1000000.0));
    }

    #[test]
    fn test_compile_bad_bound_value() {
        let mut doc = sample_datasource();
        doc["DATASOURCE"]["ifInOctets"]["ds_max_oid_value"] = json!("not-a-number");

        let err = compile(&sample_args(&[]), &doc, 60.0).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::BadNumber { attribute: "ds_max_oid_value", .. }
        ));
    }

    #[test]
    fn test_compile_bad_section_oid() {
        let mut doc = sample_datasource();
        doc["DATASOURCE"]
            .as_object_mut()
            .unwrap()
            .insert("sysUptime".to_string(), json!("1.3.6.1.2.1.1.3"));

        let err = compile(&sample_args(&[]), &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::BadOid { key, .. } if key == "sysUptime"));
    }

    #[test]
    fn test_compile_hyphen_in_structural_key() {
        let mut doc = sample_datasource();
        doc["DATASOURCE"]
            .as_object_mut()
            .unwrap()
            .insert("bad-name".to_string(), json!({"ds_oid": ".1.2.3"}));

        let err = compile(&sample_args(&[]), &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::HyphenInName(key) if key == "bad-name"));
    }

    #[test]
    fn test_compile_triggers_resolved() {
        let args = sample_args(&[("triggergroup", "if_errors")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();

        let trigger = spec.triggers.get("error_rate").unwrap();
        assert_eq!(trigger.default_status, 3);
        assert_eq!(trigger.critical.as_ref().map(Vec::len), Some(3));
        assert!(trigger.warning.is_none());
    }

    #[test]
    fn test_compile_single_string_trigger_group() {
        let args = sample_args(&[("triggergroup", "if_single")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert_eq!(spec.triggers.len(), 1);
    }

    #[test]
    fn test_compile_unknown_trigger_group_is_empty() {
        let args = sample_args(&[("triggergroup", "no-such-group")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        assert!(spec.triggers.is_empty());
    }

    #[test]
    fn test_compile_missing_trigger_definition() {
        let mut doc = sample_datasource();
        doc["TRIGGER"].as_object_mut().unwrap().remove("error_rate");

        let args = sample_args(&[("triggergroup", "if_errors")]);
        let err = compile(&args, &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTrigger(_)));
    }

    #[test]
    fn test_compile_missing_trigger_section() {
        let mut doc = sample_datasource();
        doc.as_object_mut().unwrap().remove("TRIGGER");

        let args = sample_args(&[("triggergroup", "if_errors")]);
        let err = compile(&args, &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection("TRIGGER")));
    }

    #[test]
    fn test_compile_group_default_status() {
        let args = sample_args(&[("triggergroup", "if_errors")]);
        let mut doc = sample_datasource();
        doc["TRIGGERGROUP"]["if_errors"] = json!(["bare_trigger"]);

        let spec = compile(&args, &doc, 60.0).unwrap();
        let trigger = spec.triggers.get("bare_trigger").unwrap();
        assert_eq!(trigger.default_status, 2);
        assert!(trigger.critical.is_none());
    }

    #[test]
    fn test_compile_bad_default_status() {
        let mut doc = sample_datasource();
        doc["TRIGGER"]["default_status"] = json!("high");

        let args = sample_args(&[("triggergroup", "if_errors")]);
        let err = compile(&args, &doc, 60.0).unwrap_err();
        assert!(matches!(err, ConfigError::BadStatus(_)));
    }

    #[test]
    fn test_spec_document_round_trip() {
        let args = sample_args(&[("triggergroup", "if_errors")]);
        let spec = compile(&args, &sample_datasource(), 60.0).unwrap();
        let doc = spec.to_document().unwrap();

        assert_eq!(doc["host"], json!("myhost1"));
        assert_eq!(doc["instance"], json!(null));
        assert_eq!(doc["ds"]["ifInOctets"]["ds_type"], json!("DERIVE"));
        assert_eq!(doc["triggers"]["error_rate"]["default_status"], json!(3));

        // datasource order survives the document form
        let ds_keys: Vec<&String> = doc["ds"].as_object().unwrap().keys().collect();
        assert_eq!(ds_keys, vec!["ifInOctets", "ifOutOctets"]);
    }
}
