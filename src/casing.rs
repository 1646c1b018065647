use serde_json::Value;

/// Keys whose spelling and inner-key casing are authored by the user and
/// must survive normalization untouched (guardrail check ids, conditional
/// routing conditions, vertex service-account payloads, override params).
pub const PRESERVED_KEYS: &[&str] = &[
    "override_params",
    "params",
    "checks",
    "vertex_service_account_json",
    "vertexServiceAccountJson",
    "conditions",
    "input_guardrails",
    "output_guardrails",
    "default_input_guardrails",
    "default_output_guardrails",
    "integrationModelDetails",
    "cb_config",
];

pub fn is_preserved_key(key: &str) -> bool {
    PRESERVED_KEYS.contains(&key)
}

/// Converts `snake_case` or `kebab-case` to `camelCase`. Keys already in
/// camelCase pass through unchanged.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' || c == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Recursively camelCases object keys. Keys in [`PRESERVED_KEYS`] keep their
/// original spelling and their values are not descended into.
pub fn convert_keys_to_camel_case(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let converted = map
                .into_iter()
                .map(|(key, inner)| {
                    if is_preserved_key(&key) {
                        (key, inner)
                    } else {
                        (to_camel_case(&key), convert_keys_to_camel_case(inner))
                    }
                })
                .collect();
            Value::Object(converted)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(convert_keys_to_camel_case)
                .collect(),
        ),
        other => other,
    }
}
