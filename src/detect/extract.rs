// =============================================================================
// KV Extractor — typed field capture from screen text with validation
// =============================================================================
//
// Each configured field runs its regex against the screen; capture group 1 is
// the raw value.  Comma-grouped numbers ("1,000,000") are normalized before
// parsing.  Coercion failures record an error and leave the field Missing;
// the validation verdict is a sibling record, never an entry in the value
// map.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use super::rules::{CompiledKvField, KvType};

// =============================================================================
// Value and validation types
// =============================================================================

/// A typed extracted value. `Missing` records a field whose regex did not
/// match or whose coercion failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KvValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Missing,
}

impl KvValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Validation verdict for one extraction pass. `valid == true` implies every
/// required field is present and inside its constraints; any error forces
/// `valid == false`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Result of extracting all fields for one rule.
#[derive(Debug, Clone, Serialize)]
pub struct KvData {
    pub values: BTreeMap<String, KvValue>,
    pub validation: Validation,
}

impl KvData {
    pub fn get(&self, field: &str) -> Option<&KvValue> {
        self.values.get(field)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Strip digit-group commas from numeric raw values.
fn normalize_numeric(raw: &str) -> String {
    raw.replace(',', "")
}

/// Run every configured field against `screen_text`.
pub fn extract(fields: &[CompiledKvField], screen_text: &str) -> KvData {
    let mut values = BTreeMap::new();
    let mut errors = Vec::new();

    for field in fields {
        let name = &field.spec.field;

        let raw = field
            .regex
            .captures(screen_text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());

        let value = match raw {
            None => {
                if field.spec.required {
                    errors.push(format!("{name}: required field not found"));
                }
                KvValue::Missing
            }
            Some(raw) => match coerce(&raw, field.spec.kind) {
                Ok(v) => v,
                Err(msg) => {
                    errors.push(format!("{name}: {msg}"));
                    KvValue::Missing
                }
            },
        };

        if !value.is_missing() {
            validate_field(field, name, &value, &mut errors);
        }

        values.insert(name.clone(), value);
    }

    let validation = Validation {
        valid: errors.is_empty(),
        errors,
    };
    KvData { values, validation }
}

/// Coerce a raw capture into the field's declared type.
fn coerce(raw: &str, kind: KvType) -> Result<KvValue, String> {
    match kind {
        KvType::String => Ok(KvValue::Str(raw.to_string())),
        KvType::Int => normalize_numeric(raw)
            .parse::<i64>()
            .map(KvValue::Int)
            .map_err(|_| format!("cannot parse '{raw}' as int")),
        KvType::Float => normalize_numeric(raw)
            .parse::<f64>()
            .map(KvValue::Float)
            .map_err(|_| format!("cannot parse '{raw}' as float")),
        KvType::Bool => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Ok(KvValue::Bool(true)),
            "false" | "no" | "n" | "0" | "off" => Ok(KvValue::Bool(false)),
            _ => Err(format!("cannot parse '{raw}' as bool")),
        },
    }
}

/// Evaluate min/max/pattern/allowed_values constraints for a present value.
fn validate_field(
    field: &CompiledKvField,
    name: &str,
    value: &KvValue,
    errors: &mut Vec<String>,
) {
    let Some(constraints) = &field.spec.validate else {
        return;
    };

    if let Some(numeric) = value.as_f64() {
        if let Some(min) = constraints.min {
            if numeric < min {
                errors.push(format!("{name}: value {numeric} below min {min}"));
            }
        }
        if let Some(max) = constraints.max {
            if numeric > max {
                errors.push(format!("{name}: value {numeric} exceeds max {max}"));
            }
        }
    }

    if let (Some(re), Some(s)) = (&field.constraint_pattern, value.as_str()) {
        if !re.is_match(s) {
            errors.push(format!("{name}: '{s}' does not match pattern"));
        }
    }

    if let Some(allowed) = &constraints.allowed_values {
        let as_string = match value {
            KvValue::Str(s) => s.clone(),
            KvValue::Int(v) => v.to_string(),
            KvValue::Float(v) => v.to_string(),
            KvValue::Bool(v) => v.to_string(),
            KvValue::Missing => return,
        };
        if !allowed.contains(&as_string) {
            errors.push(format!("{name}: '{as_string}' not in allowed values"));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::{Constraints, KvFieldSpec};
    use regex::Regex;

    fn field(
        name: &str,
        kind: KvType,
        pattern: &str,
        validate: Option<Constraints>,
        required: bool,
    ) -> CompiledKvField {
        CompiledKvField {
            spec: KvFieldSpec {
                field: name.to_string(),
                kind,
                regex: pattern.to_string(),
                validate: validate.clone(),
                required,
            },
            regex: Regex::new(pattern).unwrap(),
            constraint_pattern: validate
                .and_then(|c| c.pattern)
                .map(|p| Regex::new(&p).unwrap()),
        }
    }

    #[test]
    fn extracts_typed_fields_with_comma_normalization() {
        let fields = vec![
            field(
                "sector",
                KvType::Int,
                r"Sector\s+(\d+)",
                Some(Constraints {
                    min: Some(1.0),
                    max: Some(1000.0),
                    ..Default::default()
                }),
                true,
            ),
            field(
                "credits",
                KvType::Int,
                r"Credits:\s*([\d,]+)",
                Some(Constraints {
                    min: Some(0.0),
                    ..Default::default()
                }),
                true,
            ),
        ];

        let kv = extract(&fields, "Sector 499 in The Federation.  Credits: 1,000,000");
        assert_eq!(kv.get("sector").unwrap().as_i64(), Some(499));
        assert_eq!(kv.get("credits").unwrap().as_i64(), Some(1_000_000));
        assert!(kv.validation.valid);
        assert!(kv.validation.errors.is_empty());
    }

    #[test]
    fn max_violation_fails_validation() {
        let fields = vec![field(
            "sector",
            KvType::Int,
            r"Sector\s+(\d+)",
            Some(Constraints {
                min: Some(1.0),
                max: Some(1000.0),
                ..Default::default()
            }),
            true,
        )];

        let kv = extract(&fields, "Sector 9999");
        assert!(!kv.validation.valid);
        assert_eq!(kv.validation.errors.len(), 1);
        assert!(kv.validation.errors[0].contains("exceeds max 1000"));
        // The coerced value is still reported alongside the error.
        assert_eq!(kv.get("sector").unwrap().as_i64(), Some(9999));
    }

    #[test]
    fn missing_required_field_fails() {
        let fields = vec![field("credits", KvType::Int, r"Credits:\s*([\d,]+)", None, true)];
        let kv = extract(&fields, "no credits on this screen");
        assert!(!kv.validation.valid);
        assert!(kv.get("credits").unwrap().is_missing());
        assert!(kv.validation.errors[0].contains("required field not found"));
    }

    #[test]
    fn missing_optional_field_is_fine() {
        let fields = vec![field("port", KvType::String, r"Port:\s*(\w+)", None, false)];
        let kv = extract(&fields, "empty space here");
        assert!(kv.validation.valid);
        assert!(kv.get("port").unwrap().is_missing());
    }

    #[test]
    fn coercion_failure_records_error_and_missing() {
        let fields = vec![field("holds", KvType::Int, r"Holds=(\w+)", None, true)];
        let kv = extract(&fields, "Holds=lots");
        assert!(!kv.validation.valid);
        assert!(kv.get("holds").unwrap().is_missing());
        assert!(kv.validation.errors[0].contains("cannot parse"));
    }

    #[test]
    fn pattern_and_allowed_values_constraints() {
        let fields = vec![
            field(
                "class",
                KvType::String,
                r"Class\s+(\w+)",
                Some(Constraints {
                    pattern: Some(r"^[A-Z]{3}$".to_string()),
                    ..Default::default()
                }),
                true,
            ),
            field(
                "side",
                KvType::String,
                r"Side=(\w+)",
                Some(Constraints {
                    allowed_values: Some(vec!["buy".into(), "sell".into()]),
                    ..Default::default()
                }),
                true,
            ),
        ];

        let ok = extract(&fields, "Class BBS Side=buy");
        assert!(ok.validation.valid);

        let bad = extract(&fields, "Class bb Side=hold");
        assert!(!bad.validation.valid);
        assert_eq!(bad.validation.errors.len(), 2);
    }

    #[test]
    fn bool_coercion_spellings() {
        let fields = vec![field("flag", KvType::Bool, r"flag=(\w+)", None, true)];
        for (text, expected) in [("flag=yes", true), ("flag=off", false)] {
            let kv = extract(&fields, text);
            assert_eq!(kv.get("flag").unwrap(), &KvValue::Bool(expected));
        }
    }
}
