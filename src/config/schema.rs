//! JSON Schema document for the policy file format.
//!
//! Hand-assembled rather than derived: the schema is small, stable, and the
//! output shape (draft 2020-12, `additionalProperties: false` throughout)
//! keeps configs typo-safe in editors.

use serde_json::{Value, json};

/// Canonical raw URL for the published schema.
pub const SCHEMA_URL: &str =
    "https://raw.githubusercontent.com/use-tusk/fence-rs/main/docs/schema/fence.schema.json";

/// Generate the JSON Schema document for the policy format.
pub fn generate() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": SCHEMA_URL,
        "title": "Fence policy schema",
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "$schema": { "type": "string", "format": "uri" },
            "extends": {
                "type": "string",
                "description": "Parent policy: template name or file path"
            },
            "allowPty": { "type": "boolean" },
            "network": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "allowedDomains": string_array(),
                    "deniedDomains": string_array(),
                    "allowUnixSockets": string_array(),
                    "allowAllUnixSockets": { "type": "boolean" },
                    "allowLocalBinding": { "type": "boolean" },
                    "allowLocalOutbound": { "type": ["boolean", "null"] },
                    "httpProxyPort": port_schema(),
                    "socksProxyPort": port_schema(),
                }
            },
            "filesystem": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "defaultDenyRead": { "type": "boolean" },
                    "wslInterop": { "type": ["boolean", "null"] },
                    "allowRead": string_array(),
                    "allowExecute": string_array(),
                    "denyRead": string_array(),
                    "allowWrite": string_array(),
                    "denyWrite": string_array(),
                    "allowGitConfig": { "type": "boolean" },
                }
            },
            "command": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "deny": string_array(),
                    "allow": string_array(),
                    "useDefaults": { "type": ["boolean", "null"] },
                }
            },
            "ssh": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "allowedHosts": string_array(),
                    "deniedHosts": string_array(),
                    "allowedCommands": string_array(),
                    "deniedCommands": string_array(),
                    "allowAllCommands": { "type": "boolean" },
                    "inheritDeny": { "type": "boolean" },
                }
            }
        }
    })
}

fn string_array() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

fn port_schema() -> Value {
    json!({ "type": "integer", "minimum": 0, "maximum": 65535 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn schema_is_draft_2020_12_and_closed() {
        let schema = generate();
        assert_eq!(
            schema["$schema"],
            "https://json-schema.org/draft/2020-12/schema"
        );
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn schema_names_every_model_field() {
        // A config exercising every block must only use keys present in
        // the schema document.
        let cfg = Config::parse(
            r#"{
                "extends": "base",
                "allowPty": true,
                "network": {"allowedDomains": ["a.com"], "httpProxyPort": 1},
                "filesystem": {"allowWrite": ["."], "wslInterop": false},
                "command": {"deny": ["x"], "useDefaults": true},
                "ssh": {"allowedHosts": ["h"], "allowAllCommands": true}
            }"#,
        )
        .unwrap();
        let value = serde_json::to_value(&cfg).unwrap();
        let schema = generate();

        let props = schema["properties"].as_object().unwrap();
        for (key, sub) in value.as_object().unwrap() {
            let prop = props.get(key).unwrap_or_else(|| panic!("schema missing '{key}'"));
            if let Some(sub_obj) = sub.as_object() {
                if let Some(sub_props) = prop.get("properties").and_then(|p| p.as_object()) {
                    for sub_key in sub_obj.keys() {
                        assert!(
                            sub_props.contains_key(sub_key),
                            "schema missing '{key}.{sub_key}'"
                        );
                    }
                }
            }
        }
    }
}
