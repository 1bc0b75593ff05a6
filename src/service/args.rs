//! Check command option resolution.
//!
//! A service's check command carries the connection and datasource
//! options for one host/service pair. The short-option grammar belongs
//! to the calling framework; this module consumes long-form name/value
//! pairs, applies defaults and normalization, and validates what a
//! compilation pass depends on.

use std::collections::HashMap;

use super::ConfigError;

/// Resolved invocation options for one check.
#[derive(Debug, Clone)]
pub struct CheckArgs {
    pub host: String,
    pub address: String,
    pub service: String,
    pub dstemplate: String,
    // SNMP options
    pub community: String,
    pub version: u8,
    pub port: u16,
    pub timeout: u32,
    pub retry: u32,
    // Datasource options
    pub instance: Option<String>,
    pub instance_name: Option<String>,
    pub mapping: Option<String>,
    pub mapping_name: Option<String>,
    pub triggergroup: Option<String>,
    // SNMP bulk options
    pub use_getbulk: bool,
    pub max_rep_map: i64,
    // Size of request groups
    pub request_group_size: i64,
    pub no_concurrency: bool,
    /// Per-datasource maximum overrides, ds_name to literal value.
    pub max_overrides: HashMap<String, String>,
    // Hidden option
    pub real_check: bool,
}

impl CheckArgs {
    /// Split a full check command line and resolve its options.
    ///
    /// The first word is the plugin name and is discarded.
    pub fn from_command_line(command: &str) -> Result<Self, ConfigError> {
        let words =
            shell_words::split(command).map_err(|e| ConfigError::BadCommand(e.to_string()))?;
        if words.len() <= 1 {
            return Err(ConfigError::EmptyCommand);
        }
        let options = tokenize_options(&words[1..])?;
        Self::from_options(&options)
    }

    /// Resolve an already-tokenized option list.
    pub fn from_options(options: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut host = None;
        let mut address = None;
        let mut service = None;
        let mut dstemplate = None;
        let mut community = "public".to_string();
        let mut version: u8 = 2;
        let mut port: u16 = 161;
        let mut timeout: u32 = 5;
        let mut retry: u32 = 1;
        let mut instance = None;
        let mut instance_name = None;
        let mut mapping = None;
        let mut mapping_name = None;
        let mut triggergroup = None;
        let mut use_getbulk = false;
        let mut max_rep_map: i64 = 64;
        let mut request_group_size: i64 = 64;
        let mut no_concurrency = false;
        let mut max_names: Option<Vec<String>> = None;
        let mut max_values: Option<Vec<String>> = None;
        let mut real_check = false;

        for (name, value) in options {
            match normalize_name(name).as_str() {
                "host" | "host_name" => host = Some(value.clone()),
                "address" | "host_address" => address = Some(value.clone()),
                "service" => service = Some(value.clone()),
                "community" => community = value.clone(),
                "version" | "snmp_version" => version = parse_version(value)?,
                "port" => {
                    port = value.trim().parse().map_err(|_| ConfigError::BadOption {
                        option: "port",
                        value: value.clone(),
                    })?
                }
                "timeout" => {
                    timeout = value.trim().parse().map_err(|_| ConfigError::BadOption {
                        option: "timeout",
                        value: value.clone(),
                    })?
                }
                "retry" => {
                    retry = value.trim().parse().map_err(|_| ConfigError::BadOption {
                        option: "retry",
                        value: value.clone(),
                    })?
                }
                "dstemplate" => dstemplate = Some(value.clone()),
                "instance" => instance = Some(value.clone()),
                "instance_name" => instance_name = Some(value.clone()),
                "mapping" => mapping = Some(value.clone()),
                "mapping_name" => mapping_name = Some(value.clone()),
                "triggergroup" => triggergroup = Some(value.clone()),
                "use_getbulk" => use_getbulk = parse_flag("use_getbulk", value, false),
                "max_rep_map" => max_rep_map = parse_count("max_rep_map", value, 64),
                "request_group_size" => {
                    request_group_size = parse_count("request_group_size", value, 64)
                }
                "no_concurrency" => no_concurrency = parse_flag("no_concurrency", value, false),
                "maximise_datasources" => max_names = Some(split_list(value)),
                "maximise_datasources_value" => max_values = Some(split_list(value)),
                "real_check" => real_check = true,
                _ => return Err(ConfigError::UnknownOption(name.clone())),
            }
        }

        // A value of "none" or a swallowed option marker means unset
        for slot in [
            &mut mapping,
            &mut mapping_name,
            &mut instance,
            &mut instance_name,
            &mut dstemplate,
            &mut triggergroup,
        ] {
            if let Some(value) = slot.as_deref() {
                if value.starts_with('-') || value.eq_ignore_ascii_case("none") {
                    *slot = None;
                }
            }
        }

        let host = host.ok_or(ConfigError::MissingArgument("host"))?;
        let address = address.ok_or(ConfigError::MissingArgument("address"))?;
        let service = service.ok_or(ConfigError::MissingArgument("service"))?;
        let dstemplate = dstemplate.ok_or(ConfigError::MissingArgument("dstemplate"))?;

        let max_overrides = zip_overrides(max_names, max_values)?;

        Ok(CheckArgs {
            host,
            address,
            service,
            dstemplate,
            community,
            version,
            port,
            timeout,
            retry,
            instance,
            instance_name,
            mapping,
            mapping_name,
            triggergroup,
            use_getbulk,
            max_rep_map,
            request_group_size,
            no_concurrency,
            max_overrides,
            real_check,
        })
    }
}

/// Pair up long-form option words: `--name value`, `--name=value`, and
/// the bare `--real-check` flag.
fn tokenize_options(words: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    let mut options = Vec::new();
    let mut iter = words.iter();

    while let Some(word) = iter.next() {
        let name = match word.strip_prefix("--") {
            Some(name) => name,
            None => return Err(ConfigError::UnknownOption(word.clone())),
        };

        if let Some((name, value)) = name.split_once('=') {
            options.push((name.to_string(), value.to_string()));
        } else if normalize_name(name) == "real_check" {
            options.push((name.to_string(), "1".to_string()));
        } else {
            // The next word is the value, even when it looks like an
            // option marker; normalization turns those into unset
            let value = iter
                .next()
                .ok_or_else(|| ConfigError::MissingOptionValue(word.clone()))?;
            options.push((name.to_string(), value.clone()));
        }
    }

    Ok(options)
}

fn normalize_name(name: &str) -> String {
    name.trim_start_matches('-').replace('-', "_")
}

fn parse_version(value: &str) -> Result<u8, ConfigError> {
    match value.trim() {
        "1" => Ok(1),
        "2" | "2c" => Ok(2),
        "3" => Ok(3),
        _ => Err(ConfigError::BadOption {
            option: "version",
            value: value.to_string(),
        }),
    }
}

fn parse_flag(option: &str, value: &str, default: bool) -> bool {
    match value.trim().parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => {
            tracing::warn!(
                "CheckArgs: bad {} value {:?}, using {}",
                option,
                value,
                default
            );
            default
        }
    }
}

fn parse_count(option: &str, value: &str, default: i64) -> i64 {
    match value.trim().parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(
                "CheckArgs: bad {} value {:?}, using {}",
                option,
                value,
                default
            );
            default
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|item| item.trim().to_string()).collect()
}

fn zip_overrides(
    names: Option<Vec<String>>,
    values: Option<Vec<String>>,
) -> Result<HashMap<String, String>, ConfigError> {
    match (names, values) {
        (None, None) => Ok(HashMap::new()),
        (names, values) => {
            let names = names.unwrap_or_default();
            let values = values.unwrap_or_default();
            if names.is_empty() || names.len() != values.len() {
                return Err(ConfigError::OverrideLengthMismatch(
                    names.len(),
                    values.len(),
                ));
            }
            Ok(names.into_iter().zip(values).collect())
        }
    }
}
