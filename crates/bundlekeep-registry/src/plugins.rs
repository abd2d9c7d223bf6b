use serde_json::Value;

/// Plugin catalogs are either an object keyed by plugin name or an array of names.
pub fn parse_plugin_catalog(payload: &Value) -> Result<Vec<String>, String> {
    match payload {
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(ToOwned::to_owned)
                    .ok_or_else(|| format!("plugin entry must be a string: {item}"))
            })
            .collect(),
        other => Err(format!(
            "plugin catalog must be an object or array, found {}",
            json_kind(other)
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
