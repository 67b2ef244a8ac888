//! Schema Normalization
//!
//! Tool sources declare their parameters as loose JSON Schema. Model providers
//! only accept a restricted dialect, and OpenAI-style strict mode additionally
//! requires every property to be required. [`SchemaNormalizer`] turns any raw
//! schema into a [`ParameterSchema`] the selected provider will accept.
//!
//! Normalization never fails: anything it cannot make sense of degrades to a
//! permissive `{}` property.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keywords that only carry human-readable hints.
const HINT_KEYWORDS: &[&str] = &["title", "examples", "$comment"];

/// Numeric bounds that strict providers reject.
const EXCLUSIVE_BOUNDS: &[&str] = &["exclusiveMinimum", "exclusiveMaximum"];

/// Formats accepted by the OpenAI function-calling dialect.
const OPENAI_FORMATS: &[&str] = &["date-time", "date", "time", "email", "uuid"];

/// The schema dialect a model provider accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchemaDialect {
    /// Name used in logs
    pub name: &'static str,

    /// Allowed `format` values (`None` = any)
    pub allowed_formats: Option<&'static [&'static str]>,

    /// Whether exclusive numeric bounds are accepted
    pub exclusive_bounds: bool,
}

impl SchemaDialect {
    /// OpenAI Responses / Chat Completions function schemas.
    pub const fn openai() -> Self {
        Self {
            name: "openai",
            allowed_formats: Some(OPENAI_FORMATS),
            exclusive_bounds: false,
        }
    }

    /// Ollama `/api/chat` tool schemas.
    pub const fn ollama() -> Self {
        Self {
            name: "ollama",
            allowed_formats: None,
            exclusive_bounds: true,
        }
    }

    fn accepts_format(&self, format: &str) -> bool {
        self.allowed_formats.is_none_or(|allowed| allowed.contains(&format))
    }
}

impl Default for SchemaDialect {
    fn default() -> Self {
        Self::openai()
    }
}

/// Normalized parameter schema for a tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Always `"object"`
    #[serde(rename = "type")]
    pub schema_type: String,

    /// Property name → property schema
    pub properties: Map<String, Value>,

    /// Required property names, in order
    pub required: Vec<String>,

    /// `Some(false)` in strict mode, unset otherwise
    #[serde(rename = "additionalProperties", skip_serializing_if = "Option::is_none")]
    pub additional_properties: Option<bool>,
}

impl ParameterSchema {
    /// Schema with no parameters.
    pub fn empty() -> Self {
        Self {
            schema_type: "object".into(),
            properties: Map::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }

    /// Strict iff every property is required.
    pub fn is_strict(&self) -> bool {
        self.additional_properties == Some(false)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

impl Default for ParameterSchema {
    fn default() -> Self {
        Self::empty()
    }
}

/// Converts raw tool schemas into a provider's dialect.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaNormalizer {
    dialect: SchemaDialect,
}

impl SchemaNormalizer {
    pub fn new(dialect: SchemaDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SchemaDialect {
        self.dialect
    }

    /// Normalize a raw schema object.
    pub fn normalize(&self, raw: &Value) -> ParameterSchema {
        let Some(root) = raw.as_object() else {
            tracing::debug!(dialect = self.dialect.name, "Non-object schema, using empty schema");
            return ParameterSchema::empty();
        };

        let mut properties = Map::new();
        let mut optional = Vec::new();

        if let Some(raw_props) = root.get("properties").and_then(Value::as_object) {
            for (name, prop) in raw_props {
                if prop.get("default").is_some() {
                    optional.push(name.clone());
                }
                properties.insert(name.clone(), self.normalize_property(name, prop));
            }
        }

        // Declared order first, then whatever else has no default.
        let mut required: Vec<String> = Vec::new();
        let declared = root
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for name in declared.chain(properties.keys().map(String::as_str)) {
            if properties.contains_key(name)
                && !optional.iter().any(|o| o == name)
                && !required.iter().any(|r| r == name)
            {
                required.push(name.to_string());
            }
        }

        let strict = optional.is_empty();
        if !strict {
            tracing::debug!(
                dialect = self.dialect.name,
                optional = ?optional,
                "Optional parameters present, using non-strict schema"
            );
        }

        ParameterSchema {
            schema_type: "object".into(),
            properties,
            required,
            additional_properties: strict.then_some(false),
        }
    }

    fn normalize_property(&self, name: &str, prop: &Value) -> Value {
        let Some(fields) = prop.as_object() else {
            tracing::debug!(property = name, "Malformed property schema, relaxing to {{}}");
            return Value::Object(Map::new());
        };

        let mut out = Map::new();
        for (key, value) in fields {
            if HINT_KEYWORDS.contains(&key.as_str()) {
                continue;
            }
            if !self.dialect.exclusive_bounds && EXCLUSIVE_BOUNDS.contains(&key.as_str()) {
                continue;
            }
            match key.as_str() {
                "format" => {
                    if value.as_str().is_some_and(|f| self.dialect.accepts_format(f)) {
                        out.insert(key.clone(), value.clone());
                    }
                }
                "minLength" if value.as_u64() == Some(1) => {}
                "properties" => {
                    let nested = value
                        .as_object()
                        .map(|props| {
                            props
                                .iter()
                                .map(|(k, v)| (k.clone(), self.normalize_property(k, v)))
                                .collect::<Map<_, _>>()
                        })
                        .unwrap_or_default();
                    out.insert(key.clone(), Value::Object(nested));
                }
                "items" => {
                    out.insert(key.clone(), self.normalize_property(name, value));
                }
                _ => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn openai() -> SchemaNormalizer {
        SchemaNormalizer::new(SchemaDialect::openai())
    }

    #[test]
    fn test_all_required_is_strict() {
        let raw = json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "format": "uri", "title": "Url"}
            },
            "required": ["url"]
        });

        let schema = openai().normalize(&raw);
        assert!(schema.is_strict());
        assert_eq!(schema.required, vec!["url"]);
        assert_eq!(schema.properties["url"], json!({"type": "string"}));

        let value = schema.to_value();
        assert_eq!(value["additionalProperties"], json!(false));
    }

    #[test]
    fn test_default_disables_strict() {
        let raw = json!({
            "properties": {
                "url": {"type": "string"},
                "max_length": {"type": "integer", "default": 5000, "exclusiveMaximum": 1000000},
                "raw": {"type": "boolean", "default": false}
            },
            "required": ["url", "max_length"]
        });

        let schema = openai().normalize(&raw);
        assert!(!schema.is_strict());
        assert_eq!(schema.required, vec!["url"]);
        assert!(schema.to_value().get("additionalProperties").is_none());
        assert!(schema.properties["max_length"].get("exclusiveMaximum").is_none());
        assert_eq!(schema.properties["max_length"]["default"], json!(5000));
    }

    #[test]
    fn test_defaulted_property_never_required() {
        let raw = json!({
            "properties": {
                "a": {"type": "string", "default": "x"},
                "b": {"type": "string", "default": "y"}
            },
            "required": ["a", "b"]
        });

        let schema = openai().normalize(&raw);
        assert!(schema.required.is_empty());
        assert!(!schema.is_strict());
    }

    #[test]
    fn test_repeated_required_name_does_not_make_strict() {
        let raw = json!({
            "properties": {
                "a": {"type": "string"},
                "b": {"type": "string"},
                "c": {"type": "string", "default": "x"}
            },
            "required": ["a", "b", "a"]
        });

        let schema = openai().normalize(&raw);
        assert_eq!(schema.required, vec!["a", "b"]);
        assert!(!schema.is_strict());
        assert!(schema.to_value().get("additionalProperties").is_none());
    }

    #[test]
    fn test_properties_without_default_become_required() {
        let raw = json!({
            "properties": {
                "zeta": {"type": "string"},
                "alpha": {"type": "string"}
            },
            "required": ["zeta"]
        });

        let schema = openai().normalize(&raw);
        assert_eq!(schema.required, vec!["zeta", "alpha"]);
        assert!(schema.is_strict());
    }

    #[test]
    fn test_malformed_input_degrades() {
        let schema = openai().normalize(&json!("not a schema"));
        assert!(schema.properties.is_empty());
        assert!(schema.is_strict());

        let raw = json!({"properties": {"weird": 42, "ok": {"type": "number"}}});
        let schema = openai().normalize(&raw);
        assert_eq!(schema.properties["weird"], json!({}));
        assert_eq!(schema.properties["ok"], json!({"type": "number"}));
    }

    #[test]
    fn test_nested_properties_are_cleaned() {
        let raw = json!({
            "properties": {
                "filter": {
                    "type": "object",
                    "properties": {
                        "since": {"type": "string", "format": "date-time", "title": "Since"},
                        "host": {"type": "string", "format": "hostname"}
                    }
                },
                "tags": {"type": "array", "items": {"type": "string", "minLength": 1, "title": "Tag"}}
            }
        });

        let schema = openai().normalize(&raw);
        let filter = &schema.properties["filter"]["properties"];
        assert_eq!(filter["since"], json!({"type": "string", "format": "date-time"}));
        assert_eq!(filter["host"], json!({"type": "string"}));
        assert_eq!(schema.properties["tags"]["items"], json!({"type": "string"}));
    }

    #[test]
    fn test_ollama_dialect_keeps_formats() {
        let raw = json!({
            "properties": {"url": {"type": "string", "format": "uri", "exclusiveMinimum": 0}}
        });

        let schema = SchemaNormalizer::new(SchemaDialect::ollama()).normalize(&raw);
        assert_eq!(schema.properties["url"]["format"], json!("uri"));
        assert_eq!(schema.properties["url"]["exclusiveMinimum"], json!(0));
    }
}
