//! `%{NAME}` substitution inside JSON string values.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{CastleError, Result};

/// Only variables with this prefix are read from the environment.
pub const CASTLE_PREFIX: &str = "CASTLE_";

static VAR_RE: OnceLock<Regex> = OnceLock::new();

fn var_re() -> &'static Regex {
    VAR_RE.get_or_init(|| Regex::new(r"%\{([^}]*)\}").unwrap())
}

/// Rewrite every `%{key}` in every string of `value`.
///
/// `substitute` returns `Ok(None)` to leave a reference untouched. Object
/// keys are never rewritten.
pub fn transform<F>(value: &Value, substitute: &mut F) -> Result<Value>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    Ok(match value {
        Value::String(s) => Value::String(transform_str(s, substitute)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| transform(v, substitute))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), transform(v, substitute)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

fn transform_str<F>(s: &str, substitute: &mut F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut err = None;
    let out = var_re().replace_all(s, |caps: &Captures<'_>| {
        if err.is_some() {
            return caps[0].to_string();
        }
        match substitute(&caps[1]) {
            Ok(Some(v)) => v,
            Ok(None) => caps[0].to_string(),
            Err(e) => {
                err = Some(e);
                caps[0].to_string()
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(out.into_owned()),
    }
}

/// Substitute `CASTLE_*` references using `lookup`; an unset variable is an
/// error.
pub fn castle_substituter<L>(lookup: L) -> impl FnMut(&str) -> Result<Option<String>>
where
    L: Fn(&str) -> Option<String>,
{
    move |key| {
        if !key.starts_with(CASTLE_PREFIX) {
            return Ok(None);
        }
        match lookup(key) {
            Some(v) => Ok(Some(v)),
            None => Err(CastleError::InvalidConf(format!(
                "You must set the environment variable {key} to use this configuration file."
            ))),
        }
    }
}

/// Substitute from a fixed map, leaving unknown keys alone.
pub fn map_substituter(
    values: &BTreeMap<String, String>,
) -> impl FnMut(&str) -> Result<Option<String>> + '_ {
    move |key| Ok(values.get(key).cloned())
}
