//! # Parameter Validator
//!
//! Checks a raw parameter map against a declared [`ParamSchema`] before any
//! handler sees it. Checking runs in three passes over the schema:
//!
//! 1. required-field presence (defaults are filled here)
//! 2. type coercion
//! 3. constraint checks
//!
//! A field that fails one pass is skipped by the later ones, but every failure
//! of every field is collected, so the caller gets the complete set in one
//! [`ValidationError`]. Validation is synchronous and never touches a store.
//!
//! ```rust
//! use service_framework::validator::{validate, ParamRule, ParamSchema};
//! use serde_json::json;
//!
//! let schema = ParamSchema::new()
//!     .field("id", ParamRule::string())
//!     .field("value", ParamRule::number().integer().positive());
//!
//! let raw = json!({ "id": "123", "value": -5 }).as_object().cloned().unwrap();
//! let err = validate(&schema, raw, "products.decreaseQuantity", "node-1").unwrap_err();
//! assert_eq!(err.failures[0].kind, "numberPositive");
//! ```

use crate::error::{ValidationError, ValidationFailure};
use serde_json::{Map, Number, Value};

/// Normalized parameters handed to handlers.
pub type Params = Map<String, Value>;

/// Takes the map out of a JSON object. Anything else yields no parameters.
pub fn into_params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
    Enum(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Positive,
    Integer,
    Min(f64),
    Max(f64),
    MinLength(usize),
    MaxLength(usize),
    NotEmpty,
}

/// Rule for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamRule {
    kind: ParamType,
    optional: bool,
    convert: bool,
    default: Option<Value>,
    constraints: Vec<Constraint>,
}

impl ParamRule {
    fn of(kind: ParamType) -> Self {
        Self {
            kind,
            optional: false,
            convert: false,
            default: None,
            constraints: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::of(ParamType::String)
    }

    pub fn number() -> Self {
        Self::of(ParamType::Number)
    }

    pub fn boolean() -> Self {
        Self::of(ParamType::Boolean)
    }

    pub fn object() -> Self {
        Self::of(ParamType::Object)
    }

    pub fn array() -> Self {
        Self::of(ParamType::Array)
    }

    pub fn any() -> Self {
        Self::of(ParamType::Any)
    }

    pub fn one_of(values: impl IntoIterator<Item = Value>) -> Self {
        Self::of(ParamType::Enum(values.into_iter().collect()))
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Value used when the field is absent. Implies `optional`.
    pub fn default(mut self, value: Value) -> Self {
        self.optional = true;
        self.default = Some(value);
        self
    }

    /// Accept string forms of numbers and booleans.
    pub fn convert(mut self) -> Self {
        self.convert = true;
        self
    }

    pub fn positive(self) -> Self {
        self.constraint(Constraint::Positive)
    }

    pub fn integer(self) -> Self {
        self.constraint(Constraint::Integer)
    }

    pub fn min(self, min: f64) -> Self {
        self.constraint(Constraint::Min(min))
    }

    pub fn max(self, max: f64) -> Self {
        self.constraint(Constraint::Max(max))
    }

    pub fn min_length(self, len: usize) -> Self {
        self.constraint(Constraint::MinLength(len))
    }

    pub fn max_length(self, len: usize) -> Self {
        self.constraint(Constraint::MaxLength(len))
    }

    pub fn not_empty(self) -> Self {
        self.constraint(Constraint::NotEmpty)
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn kind(&self) -> &ParamType {
        &self.kind
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Ordered set of field rules for one action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    fields: Vec<(String, ParamRule)>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the rule for `name`.
    pub fn field(mut self, name: impl Into<String>, rule: ParamRule) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = rule,
            None => self.fields.push((name, rule)),
        }
        self
    }

    /// Appends every rule of `other`, replacing rules with the same name.
    pub fn merge(self, other: ParamSchema) -> Self {
        other
            .fields
            .into_iter()
            .fold(self, |schema, (name, rule)| schema.field(name, rule))
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ParamRule)> {
        self.fields.iter().map(|(n, r)| (n.as_str(), r))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Keeps only the declared fields of `params`, in declaration order.
    pub fn project(&self, params: &Params) -> Params {
        self.fields
            .iter()
            .filter_map(|(name, _)| params.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }
}

/// Validates `raw` against `schema`, returning the normalized parameters.
///
/// Fields the schema does not mention pass through untouched.
pub fn validate(
    schema: &ParamSchema,
    raw: Params,
    action: &str,
    node_id: &str,
) -> Result<Params, ValidationError> {
    let mut params = raw;
    let mut failures = Vec::new();
    let fail = |field: &str, kind: &str, message: String, actual: Value| ValidationFailure {
        kind: kind.to_string(),
        field: field.to_string(),
        message,
        actual,
        action: action.to_string(),
        node_id: node_id.to_string(),
    };

    // Pass 1: presence
    let mut present = Vec::new();
    for (name, rule) in schema.fields() {
        match params.get(name) {
            None | Some(Value::Null) => {
                if let Some(default) = &rule.default {
                    params.insert(name.to_string(), default.clone());
                } else if !rule.optional {
                    failures.push(fail(
                        name,
                        "required",
                        format!("The '{name}' field is required."),
                        Value::Null,
                    ));
                }
            }
            Some(_) => present.push((name, rule)),
        }
    }

    // Pass 2: types
    let mut typed = Vec::new();
    for (name, rule) in present {
        let Some(value) = params.get(name) else { continue };
        match coerce(rule, value) {
            Ok(coerced) => {
                params.insert(name.to_string(), coerced);
                typed.push((name, rule));
            }
            Err((kind, message)) => {
                failures.push(fail(name, kind, message.replace("{field}", name), value.clone()))
            }
        }
    }

    // Pass 3: constraints
    for (name, rule) in typed {
        let Some(value) = params.get(name) else { continue };
        for constraint in &rule.constraints {
            if let Err((kind, message)) = check(constraint, value) {
                failures.push(fail(name, kind, message.replace("{field}", name), value.clone()));
            }
        }
    }

    if failures.is_empty() {
        Ok(params)
    } else {
        Err(ValidationError::new(action, failures))
    }
}

type Rejection = (&'static str, String);

fn coerce(rule: &ParamRule, value: &Value) -> Result<Value, Rejection> {
    match &rule.kind {
        ParamType::Any => Ok(value.clone()),
        ParamType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(_) | Value::Bool(_) if rule.convert => Ok(Value::String(value.to_string())),
            _ => Err(("string", "The '{field}' field must be a string.".into())),
        },
        ParamType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) if rule.convert => parse_number(s)
                .ok_or(("number", "The '{field}' field must be a number.".into())),
            _ => Err(("number", "The '{field}' field must be a number.".into())),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if rule.convert => match s.as_str() {
                "true" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(("boolean", "The '{field}' field must be a boolean.".into())),
            },
            Value::Number(n) if rule.convert => match n.as_i64() {
                Some(1) => Ok(Value::Bool(true)),
                Some(0) => Ok(Value::Bool(false)),
                _ => Err(("boolean", "The '{field}' field must be a boolean.".into())),
            },
            _ => Err(("boolean", "The '{field}' field must be a boolean.".into())),
        },
        ParamType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(("object", "The '{field}' field must be an Object.".into())),
        },
        ParamType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(("array", "The '{field}' field must be an array.".into())),
        },
        ParamType::Enum(allowed) => {
            if allowed.contains(value) {
                Ok(value.clone())
            } else {
                let expected = allowed
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                Err((
                    "enumValue",
                    format!("The '{{field}}' field value must be one of: {expected}."),
                ))
            }
        }
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn check(constraint: &Constraint, value: &Value) -> Result<(), Rejection> {
    let number = value.as_f64();
    let text = value.as_str();
    match constraint {
        Constraint::Positive => match number {
            Some(n) if n <= 0.0 => Err((
                "numberPositive",
                "The '{field}' field must be a positive number.".into(),
            )),
            _ => Ok(()),
        },
        Constraint::Integer => match number {
            Some(n) if n.fract() != 0.0 => {
                Err(("numberInteger", "The '{field}' field must be an integer.".into()))
            }
            _ => Ok(()),
        },
        Constraint::Min(min) => match number {
            Some(n) if n < *min => Err((
                "numberMin",
                format!("The '{{field}}' field must be greater than or equal to {min}."),
            )),
            _ => Ok(()),
        },
        Constraint::Max(max) => match number {
            Some(n) if n > *max => Err((
                "numberMax",
                format!("The '{{field}}' field must be less than or equal to {max}."),
            )),
            _ => Ok(()),
        },
        Constraint::MinLength(len) => match text {
            Some(s) if s.chars().count() < *len => Err((
                "stringMin",
                format!(
                    "The '{{field}}' field length must be greater than or equal to {len} characters long."
                ),
            )),
            _ => Ok(()),
        },
        Constraint::MaxLength(len) => match text {
            Some(s) if s.chars().count() > *len => Err((
                "stringMax",
                format!(
                    "The '{{field}}' field length must be less than or equal to {len} characters long."
                ),
            )),
            _ => Ok(()),
        },
        Constraint::NotEmpty => match text {
            Some("") => Err(("stringEmpty", "The '{field}' field must not be empty.".into())),
            _ => Ok(()),
        },
    }
}
