//! Value computation for polled datasources.
//!
//! Turns one raw sampled value into its computed form: a type-specific
//! formatter first (gauge cast, counter rate with wraparound handling,
//! text passthrough), then the optional RPN post-processing formula
//! declared on the datasource.

mod formula;

pub use formula::*;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Wrap limit for 32-bit counters.
pub const COUNTER32_LIMIT: u64 = u32::MAX as u64;
/// Wrap limit for 64-bit counters.
pub const COUNTER64_LIMIT: u64 = u64::MAX;

/// Computation error types.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("time delta is 0s, cannot compute a rate")]
    ZeroTimeDelta,
    #[error("waiting for an additional sample to compute a rate")]
    NeedMoreSamples,
    #[error("value {0:?} is not numeric")]
    NotNumeric(String),
    #[error("unknown datasource type {0:?}")]
    UnknownType(String),
    #[error("formula placeholder {0:?} has no value in this context")]
    UnknownPlaceholder(String),
    #[error("formula produced no value")]
    EmptyFormula,
}

impl ComputeError {
    /// True for the expected wait-one-more-cycle condition, as opposed to
    /// a data or formula authoring bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::NeedMoreSamples)
    }
}

/// Datasource value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DsType {
    Text,
    Gauge,
    Counter,
    Counter64,
    Derive,
    Derive64,
}

impl DsType {
    /// Parse a declared type name, case-insensitive.
    pub fn parse(name: &str) -> Option<DsType> {
        match name.to_uppercase().as_str() {
            "TEXT" => Some(DsType::Text),
            "GAUGE" => Some(DsType::Gauge),
            "COUNTER" => Some(DsType::Counter),
            "COUNTER64" => Some(DsType::Counter64),
            "DERIVE" => Some(DsType::Derive),
            "DERIVE64" => Some(DsType::Derive64),
            _ => None,
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DsType::Text => "TEXT",
            DsType::Gauge => "GAUGE",
            DsType::Counter => "COUNTER",
            DsType::Counter64 => "COUNTER64",
            DsType::Derive => "DERIVE",
            DsType::Derive64 => "DERIVE64",
        };
        f.write_str(name)
    }
}

/// One raw value as sampled from a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl RawValue {
    /// Numeric view; text is parsed.
    pub fn as_f64(&self) -> Result<f64, ComputeError> {
        match self {
            RawValue::Unsigned(n) => Ok(*n as f64),
            RawValue::Float(f) => Ok(*f),
            RawValue::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ComputeError::NotNumeric(s.clone())),
        }
    }

    /// Counter view, exact over the full 64-bit range.
    pub fn as_u64(&self) -> Result<u64, ComputeError> {
        match self {
            RawValue::Unsigned(n) => Ok(*n),
            RawValue::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Ok(*f as u64),
            RawValue::Float(f) => Err(ComputeError::NotNumeric(f.to_string())),
            RawValue::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| ComputeError::NotNumeric(s.clone())),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            RawValue::Unsigned(n) => n.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Text(s) => s.clone(),
        }
    }
}

/// A fully computed datasource value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComputedValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl ComputedValue {
    pub fn to_text(&self) -> String {
        match self {
            ComputedValue::Number(n) => n.to_string(),
            ComputedValue::Bool(b) => b.to_string(),
            ComputedValue::Text(s) => s.clone(),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            ComputedValue::Number(n) => Value::from(*n),
            ComputedValue::Bool(b) => Value::Bool(*b),
            ComputedValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl From<CalcValue> for ComputedValue {
    fn from(value: CalcValue) -> Self {
        match value {
            CalcValue::Number(n) => ComputedValue::Number(n),
            CalcValue::Bool(b) => ComputedValue::Bool(b),
        }
    }
}

/// Everything needed to compute one datasource's value for one cycle:
/// the fresh sample, the cached previous sample, and the datasource
/// declaration fields the formatters and formula may reference.
#[derive(Debug, Clone)]
pub struct ReadingContext {
    pub ds_type: DsType,
    pub value: RawValue,
    pub check_time: f64,
    pub last_value: Option<RawValue>,
    pub last_check_time: Option<f64>,
    pub last_computed: Option<ComputedValue>,
    pub calc: Option<Vec<Value>>,
    pub max_value: Option<f64>,
    pub min_value: Option<f64>,
}

impl ReadingContext {
    /// Value for a `%(name)s` placeholder in a formula token, if this
    /// context carries one.
    fn placeholder(&self, name: &str) -> Option<String> {
        match name {
            "value" => Some(self.value.to_text()),
            "check_time" => Some(self.check_time.to_string()),
            "last_value" => self.last_value.as_ref().map(RawValue::to_text),
            "last_check_time" => self.last_check_time.map(|t| t.to_string()),
            "last_computed" => self.last_computed.as_ref().map(ComputedValue::to_text),
            "ds_max" => self.max_value.map(|v| v.to_string()),
            "ds_min" => self.min_value.map(|v| v.to_string()),
            _ => None,
        }
    }
}

/// Rate of change between two counter samples.
///
/// A sample below the previous one means the counter wrapped: the delta
/// then runs through `limit` and back up to the new value. `limit` is
/// `2^32 - 1` for 32-bit counters and `2^64 - 1` for 64-bit ones.
pub fn derive(
    value: u64,
    last_value: u64,
    check_time: f64,
    last_check_time: f64,
    limit: u64,
) -> Result<f64, ComputeError> {
    let t_delta = check_time - last_check_time;
    if t_delta == 0.0 {
        return Err(ComputeError::ZeroTimeDelta);
    }

    // u128 keeps the wrapped delta exact near the 64-bit limit
    let d_delta: u128 = if value < last_value {
        (limit as u128).saturating_sub(last_value as u128) + value as u128
    } else {
        (value - last_value) as u128
    };

    Ok(d_delta as f64 / t_delta)
}

/// Compute the final value for one reading.
///
/// Applies the type formatter, then feeds `[base value] + ds_calc` to
/// the RPN calculator when the datasource declares a formula, resolving
/// `%(name)s` placeholders in each token first.
pub fn compute_value(ctx: &ReadingContext) -> Result<ComputedValue, ComputeError> {
    let base = format_value(ctx)?;

    let tokens = match &ctx.calc {
        Some(tokens) if !tokens.is_empty() => tokens,
        _ => return Ok(base),
    };

    let mut elements = Vec::with_capacity(tokens.len() + 1);
    elements.push(base.to_json());
    for token in tokens {
        elements.push(resolve_placeholders(token, ctx)?);
    }

    let result = rpn_calculator(&elements)?;
    result
        .map(ComputedValue::from)
        .ok_or(ComputeError::EmptyFormula)
}

fn format_value(ctx: &ReadingContext) -> Result<ComputedValue, ComputeError> {
    match ctx.ds_type {
        DsType::Text => Ok(ComputedValue::Text(ctx.value.to_text())),
        DsType::Gauge => Ok(ComputedValue::Number(ctx.value.as_f64()?)),
        // NOTE: the wrap limit is not applied to plain counters, only to
        // the rate types below
        DsType::Counter | DsType::Counter64 => Ok(ComputedValue::Number(ctx.value.as_f64()?)),
        DsType::Derive => format_derive(ctx, COUNTER32_LIMIT),
        DsType::Derive64 => format_derive(ctx, COUNTER64_LIMIT),
    }
}

fn format_derive(ctx: &ReadingContext, limit: u64) -> Result<ComputedValue, ComputeError> {
    let last_value = ctx
        .last_value
        .as_ref()
        .ok_or(ComputeError::NeedMoreSamples)?;
    let last_check_time = ctx.last_check_time.ok_or(ComputeError::NeedMoreSamples)?;

    let rate = derive(
        ctx.value.as_u64()?,
        last_value.as_u64()?,
        ctx.check_time,
        last_check_time,
        limit,
    )?;
    Ok(ComputedValue::Number(rate))
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\(([A-Za-z0-9_]+)\)s").unwrap())
}

fn resolve_placeholders(token: &Value, ctx: &ReadingContext) -> Result<Value, ComputeError> {
    let text = match token.as_str() {
        Some(text) if text.contains("%(") => text,
        _ => return Ok(token.clone()),
    };

    let mut missing: Option<String> = None;
    let resolved = placeholder_regex().replace_all(text, |caps: &regex::Captures| {
        match ctx.placeholder(&caps[1]) {
            Some(value) => value,
            None => {
                missing = Some(caps[1].to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ComputeError::UnknownPlaceholder(name)),
        None => Ok(Value::String(resolved.into_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(ds_type: DsType, value: RawValue) -> ReadingContext {
        ReadingContext {
            ds_type,
            value,
            check_time: 1412776670.0,
            last_value: None,
            last_check_time: None,
            last_computed: None,
            calc: None,
            max_value: None,
            min_value: None,
        }
    }

    #[test]
    fn test_derive_simple() {
        let rate = derive(20, 10, 1412776670.0, 1412776660.0, COUNTER32_LIMIT).unwrap();
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn test_derive_wraps_at_32_bits() {
        let rate = derive(15, 4294967290, 1412776670.0, 1412776660.0, COUNTER32_LIMIT).unwrap();
        assert_eq!(rate, 2.0);
    }

    #[test]
    fn test_derive_wraps_at_64_bits() {
        let rate = derive(
            20,
            u64::MAX - 10,
            1412776670.0,
            1412776660.0,
            COUNTER64_LIMIT,
        )
        .unwrap();
        assert_eq!(rate, 3.0);
    }

    #[test]
    fn test_derive_zero_time_delta() {
        let err = derive(20, 10, 1412776670.0, 1412776670.0, COUNTER32_LIMIT).unwrap_err();
        assert!(matches!(err, ComputeError::ZeroTimeDelta));
    }

    #[test]
    fn test_text_passthrough() {
        let ctx = context(
            DsType::Text,
            RawValue::Text("Text collected from SNMP".to_string()),
        );
        let value = compute_value(&ctx).unwrap();
        assert_eq!(
            value,
            ComputedValue::Text("Text collected from SNMP".to_string())
        );
    }

    #[test]
    fn test_gauge_cast() {
        let ctx = context(DsType::Gauge, RawValue::Unsigned(42));
        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(42.0));

        let ctx = context(DsType::Gauge, RawValue::Text("3.5".to_string()));
        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(3.5));
    }

    #[test]
    fn test_counter_casts_without_wrap_handling() {
        let ctx = context(DsType::Counter, RawValue::Unsigned(4294967295));
        assert_eq!(
            compute_value(&ctx).unwrap(),
            ComputedValue::Number(4294967295.0)
        );
    }

    #[test]
    fn test_derive_needs_previous_sample() {
        let ctx = context(DsType::Derive, RawValue::Unsigned(20));
        let err = compute_value(&ctx).unwrap_err();
        assert!(matches!(err, ComputeError::NeedMoreSamples));
        assert!(err.is_transient());
    }

    #[test]
    fn test_derive_with_previous_sample() {
        let mut ctx = context(DsType::Derive, RawValue::Unsigned(20));
        ctx.last_value = Some(RawValue::Unsigned(10));
        ctx.last_check_time = Some(1412776660.0);

        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(1.0));
    }

    #[test]
    fn test_derive64_with_wraparound() {
        let mut ctx = context(DsType::Derive64, RawValue::Unsigned(20));
        ctx.last_value = Some(RawValue::Unsigned(u64::MAX - 10));
        ctx.last_check_time = Some(1412776660.0);

        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(3.0));
    }

    #[test]
    fn test_calc_applied_after_format() {
        let mut ctx = context(DsType::Gauge, RawValue::Unsigned(120));
        ctx.calc = Some(vec![json!(60), json!("div")]);

        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(2.0));
    }

    #[test]
    fn test_calc_placeholder_substitution() {
        // percent of configured maximum: value, max, div, 100, mul
        let mut ctx = context(DsType::Gauge, RawValue::Unsigned(50));
        ctx.max_value = Some(200.0);
        ctx.calc = Some(vec![
            json!("%(ds_max)s"),
            json!("div"),
            json!(100),
            json!("mul"),
        ]);

        assert_eq!(compute_value(&ctx).unwrap(), ComputedValue::Number(25.0));
    }

    #[test]
    fn test_calc_unknown_placeholder() {
        let mut ctx = context(DsType::Gauge, RawValue::Unsigned(50));
        ctx.calc = Some(vec![json!("%(ds_max)s"), json!("div")]);

        let err = compute_value(&ctx).unwrap_err();
        assert!(matches!(err, ComputeError::UnknownPlaceholder(name) if name == "ds_max"));
    }

    #[test]
    fn test_calc_formula_error_surfaces() {
        let mut ctx = context(DsType::Gauge, RawValue::Unsigned(50));
        ctx.calc = Some(vec![json!("frob")]);

        let err = compute_value(&ctx).unwrap_err();
        assert!(matches!(err, ComputeError::Formula(FormulaError::UnknownToken(_))));
    }

    #[test]
    fn test_ds_type_parse() {
        assert_eq!(DsType::parse("derive64"), Some(DsType::Derive64));
        assert_eq!(DsType::parse("Gauge"), Some(DsType::Gauge));
        assert_eq!(DsType::parse("bogus"), None);
    }

    #[test]
    fn test_raw_value_counter_view() {
        assert_eq!(RawValue::Unsigned(7).as_u64().unwrap(), 7);
        assert_eq!(RawValue::Text(" 12 ".to_string()).as_u64().unwrap(), 12);
        assert!(RawValue::Float(1.5).as_u64().is_err());
        assert!(RawValue::Text("x".to_string()).as_u64().is_err());
    }
}
