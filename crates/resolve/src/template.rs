//! Parameter templating: `{{ .Path.Seg }}` substitution over a scope tree.
//!
//! The scope is a JSON value with roots like `User`, `Labels`, `Target` and
//! `Discovery`. A path that does not resolve to a scalar fails with
//! `UnresolvedTemplate` naming the template and the site it appeared at.

use ballast_core::{BallastError, BallastResult};
use serde_json::Value;

/// Expand every `{{ ... }}` occurrence in one string.
pub fn expand(input: &str, scope: &Value, site: &str) -> BallastResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| BallastError::UnresolvedTemplate {
            template: input.to_string(),
            site: site.to_string(),
        })?;
        let expr = after[..end].trim();
        out.push_str(&lookup_scalar(expr, scope, input, site)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Expand every string leaf of a value tree.
pub fn expand_value(value: &Value, scope: &Value, site: &str) -> BallastResult<Value> {
    Ok(match value {
        Value::String(s) => Value::String(expand(s, scope, site)?),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| expand_value(v, scope, site)).collect::<BallastResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), expand_value(v, scope, site)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// True when a value tree still carries an unexpanded template marker.
pub fn has_unexpanded(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("{{"),
        Value::Array(items) => items.iter().any(has_unexpanded),
        Value::Object(map) => map.values().any(has_unexpanded),
        _ => false,
    }
}

fn lookup_scalar(expr: &str, scope: &Value, template: &str, site: &str) -> BallastResult<String> {
    let unresolved = || BallastError::UnresolvedTemplate {
        template: template.to_string(),
        site: site.to_string(),
    };
    let path = expr.strip_prefix('.').ok_or_else(unresolved)?;
    if path.is_empty() {
        return Err(unresolved());
    }
    let mut cur = scope;
    for seg in path.split('.') {
        if seg.is_empty() {
            return Err(unresolved());
        }
        cur = match cur {
            Value::Object(map) => map.get(seg).ok_or_else(unresolved)?,
            _ => return Err(unresolved()),
        };
    }
    match cur {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(unresolved()),
    }
}
