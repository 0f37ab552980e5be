use serde_json::{json, Value};

/// Get JSON schema for orchestrator configuration validation
pub fn get_orchestrator_config_schema() -> Value {
    let non_empty = json!({ "type": "string", "minLength": 1 });
    let seconds = json!({ "type": "integer", "minimum": 1 });

    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["version", "paths", "tls", "kms", "tools", "deployment", "observability"],
        "properties": {
            "version": {
                "type": "string",
                "pattern": "^[0-9]+\\.[0-9]+$"
            },
            "paths": {
                "type": "object",
                "required": ["secrets_dir", "projects_dir", "templates_dir", "proxy_site_config"],
                "properties": {
                    "secrets_dir": non_empty,
                    "projects_dir": non_empty,
                    "templates_dir": non_empty,
                    "proxy_site_config": non_empty
                }
            },
            "tls": {
                "type": "object",
                "required": ["ssl_path", "cert_path", "key_path"],
                "properties": {
                    "ssl_path": { "type": "string" },
                    "cert_path": { "type": "string" },
                    "key_path": { "type": "string" },
                    "verify_files": { "type": "boolean" }
                }
            },
            "kms": {
                "type": "object",
                "required": ["endpoints", "folder_id", "iam_token", "algorithm", "rotation_period", "request_timeout_seconds"],
                "properties": {
                    "endpoints": {
                        "type": "object",
                        "required": ["create", "list", "encrypt", "decrypt"],
                        "properties": {
                            "create": { "type": "string", "pattern": "^https?://.+" },
                            "list": { "type": "string", "pattern": "^https?://.+" },
                            "encrypt": { "type": "string", "pattern": "^https?://.+\\{keyId\\}.*$" },
                            "decrypt": { "type": "string", "pattern": "^https?://.+\\{keyId\\}.*$" }
                        }
                    },
                    "folder_id": { "type": "string" },
                    "iam_token": non_empty,
                    "algorithm": {
                        "type": "string",
                        "enum": ["AES_128", "AES_192", "AES_256", "AES_256_HSM"]
                    },
                    "rotation_period": {
                        "type": "string",
                        "pattern": "^[0-9]+s$"
                    },
                    "request_timeout_seconds": seconds
                }
            },
            "tools": {
                "type": "object",
                "required": ["git", "scanner", "docker", "proxy_reload", "privileged_remove", "timeouts"],
                "properties": {
                    "git": non_empty,
                    "docker": non_empty,
                    "scanner": {
                        "type": "object",
                        "required": ["program", "args"],
                        "properties": {
                            "program": non_empty,
                            "args": { "type": "array", "items": { "type": "string" } },
                            "exclude": { "type": "array", "items": { "type": "string" } }
                        }
                    },
                    "proxy_reload": { "type": "array", "items": { "type": "string" } },
                    "privileged_remove": { "type": "array", "items": { "type": "string" } },
                    "timeouts": {
                        "type": "object",
                        "required": ["clone_seconds", "scan_seconds", "build_seconds", "up_seconds", "down_seconds", "reload_seconds"],
                        "properties": {
                            "clone_seconds": seconds,
                            "scan_seconds": seconds,
                            "build_seconds": seconds,
                            "up_seconds": seconds,
                            "down_seconds": seconds,
                            "reload_seconds": seconds
                        }
                    }
                }
            },
            "deployment": {
                "type": "object",
                "required": ["base_domain", "manifest_file", "required_variables"],
                "properties": {
                    "base_domain": non_empty,
                    "manifest_file": non_empty,
                    "required_variables": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["group", "names"],
                            "properties": {
                                "group": non_empty,
                                "names": {
                                    "type": "array",
                                    "items": { "type": "string", "pattern": "^[A-Z][A-Z0-9_]*$" }
                                }
                            }
                        }
                    }
                }
            },
            "observability": {
                "type": "object",
                "required": ["logging", "metrics"],
                "properties": {
                    "logging": {
                        "type": "object",
                        "required": ["level", "format"],
                        "properties": {
                            "level": {
                                "type": "string",
                                "enum": ["Error", "Warning", "Info", "Debug", "Trace"]
                            },
                            "format": {
                                "type": "string",
                                "enum": ["Plain", "Json"]
                            }
                        }
                    },
                    "metrics": {
                        "type": "object",
                        "required": ["enabled"],
                        "properties": {
                            "enabled": { "type": "boolean" },
                            "listen_addr": { "type": ["string", "null"] }
                        }
                    }
                }
            }
        }
    })
}

/// Validate configuration against JSON schema
pub fn validate_config_against_schema(config_json: &Value) -> Result<(), String> {
    let schema = get_orchestrator_config_schema();

    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|e| format!("Failed to compile schema: {}", e))?;

    compiled.validate(config_json)
        .map_err(|errors| {
            let error_msgs: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            error_msgs.join(", ")
        })
}
