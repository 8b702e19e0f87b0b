//! Wrapped values — the runtime's unit of data.
//!
//! Every expression value at a variable binding is a [`WrappedValue`]: a
//! payload plus metadata (declared type, origin tag, async handle, flags).
//! Rather than a payload with an optional error flag, the ok/err split is a
//! sum type ([`ValueData`]), so `error = true ⇒ payload = null` holds by
//! construction. The `.err` / `.errDetails` accessors available to script
//! code are materialized on demand by the step engine.

use std::fmt::{self, Display};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    error::ErrorDetails,
    scheduler::OpId,
};

/// Payload of a wrapped value.
///
/// Records use an insertion-ordered map so that field order is preserved
/// through JSON round-trips and context formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Record(IndexMap<String, Payload>),
    Seq(Vec<Payload>),
    /// A model descriptor usable as the target of `do` / `vibe` operations.
    Model(ModelDescriptor),
    /// A tool descriptor, only usable through a model's tool list.
    Tool(ToolDescriptor),
    /// An integer range `start..end`, iterated inclusively by `for`.
    Range { start: i64, end: i64 },
}

impl Payload {
    /// Name of the payload's runtime type, for error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) | Self::Float(_) => "number",
            Self::Bool(_) => "boolean",
            Self::Text(_) => "text",
            Self::Record(_) => "json",
            Self::Seq(_) => "array",
            Self::Model(_) => "model",
            Self::Tool(_) => "tool",
            Self::Range { .. } => "range",
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts a JSON value into a payload. Lossless except that JSON
    /// numbers outside i64 become floats.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(items) => Self::Seq(items.into_iter().map(Self::from_json).collect()),
            serde_json::Value::Object(fields) => {
                Self::Record(fields.into_iter().map(|(k, v)| (k, Self::from_json(v))).collect())
            }
        }
    }

    /// Converts the payload to a JSON value. Models and tools serialize as
    /// their descriptor records; ranges as two-field objects.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Bool(b) => serde_json::Value::from(*b),
            Self::Text(s) => serde_json::Value::from(s.clone()),
            Self::Record(fields) => {
                serde_json::Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
            Self::Seq(items) => serde_json::Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Model(m) => serde_json::to_value(m).unwrap_or(serde_json::Value::Null),
            Self::Tool(t) => serde_json::to_value(t).unwrap_or(serde_json::Value::Null),
            Self::Range { start, end } => serde_json::json!({ "start": start, "end": end }),
        }
    }

    /// Renders the payload as display text, the form used by `print` and by
    /// string concatenation. Null renders as empty text.
    #[must_use]
    pub fn display_text(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Text(s) => s.clone(),
            Self::Model(m) => format!("<model {}>", m.name),
            Self::Tool(t) => format!("<tool {}>", t.name),
            Self::Range { start, end } => format!("{start}..{end}"),
            Self::Record(_) | Self::Seq(_) => serde_json::to_string(&self.to_json()).unwrap_or_default(),
        }
    }
}

/// Descriptor record carried by `model` values.
///
/// `name` and `api_key` are required at wrap time; everything else is
/// optional provider configuration.
// NOTE: no serde field-skipping on this or any other state-reachable type —
// suspended state serializes through postcard, which is not self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub thinking_level: Option<String>,
    #[serde(default)]
    pub server_tools: Vec<String>,
}

impl ModelDescriptor {
    /// Builds a descriptor from a record payload, checking required fields.
    pub fn from_record(fields: &IndexMap<String, Payload>, var_name: &str) -> Result<Self, ErrorDetails> {
        let get_text = |key: &str| match fields.get(key) {
            Some(Payload::Text(s)) => Some(s.clone()),
            _ => None,
        };
        let Some(name) = get_text("name") else {
            return Err(ErrorDetails::value_error(format!(
                "model '{var_name}' is missing required field 'name'"
            )));
        };
        let Some(api_key) = get_text("api_key") else {
            return Err(ErrorDetails::value_error(format!(
                "model '{var_name}' is missing required field 'api_key'"
            )));
        };
        let mut tools = Vec::new();
        if let Some(Payload::Seq(items)) = fields.get("tools") {
            for item in items {
                match item {
                    Payload::Tool(t) => tools.push(t.clone()),
                    other => {
                        return Err(ErrorDetails::value_error(format!(
                            "model '{var_name}' tools list contains a non-tool value of type {}",
                            other.type_name()
                        )));
                    }
                }
            }
        }
        let mut server_tools = Vec::new();
        if let Some(Payload::Seq(items)) = fields.get("server_tools") {
            for item in items {
                if let Payload::Text(s) = item {
                    server_tools.push(s.clone());
                }
            }
        }
        Ok(Self {
            name,
            api_key,
            url: get_text("url"),
            provider: get_text("provider"),
            tools,
            thinking_level: get_text("thinking_level"),
            server_tools,
        })
    }
}

/// Schema description of a tool, advertised to providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

/// Origin tag of a wrapped value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
pub enum ValueSource {
    Literal,
    Ai,
    HostBlock,
    ImportedFunction,
    VibeFunction,
    User,
}

/// Declared type tag on a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeclaredType {
    Text,
    Number,
    Boolean,
    Json,
    Model,
    Tool,
    /// `T[]` for one of the four array-able element types.
    Array(Box<DeclaredType>),
    /// A named structural type resolved through the program's type defs.
    Named(String),
}

impl DeclaredType {
    /// Whether this tag may be the element type of an array declaration.
    #[must_use]
    pub fn arrayable(&self) -> bool {
        matches!(self, Self::Text | Self::Number | Self::Boolean | Self::Json)
    }
}

impl Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Json => f.write_str("json"),
            Self::Model => f.write_str("model"),
            Self::Tool => f.write_str("tool"),
            Self::Array(elem) => write!(f, "{elem}[]"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl FromStr for DeclaredType {
    type Err = ErrorDetails;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(elem) = s.strip_suffix("[]") {
            let inner = elem.parse::<Self>()?;
            if !inner.arrayable() {
                return Err(ErrorDetails::value_error(format!("'{s}' is not a valid array type")));
            }
            return Ok(Self::Array(Box::new(inner)));
        }
        Ok(match s {
            "text" => Self::Text,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "json" => Self::Json,
            "model" => Self::Model,
            "tool" => Self::Tool,
            name if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') => {
                Self::Named(name.to_owned())
            }
            other => return Err(ErrorDetails::value_error(format!("unknown type '{other}'"))),
        })
    }
}

/// A named structural type: an ordered list of field name/type pairs.
/// Recursion happens through `DeclaredType::Named` fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralType {
    pub name: String,
    pub fields: Vec<(String, DeclaredType)>,
}

/// Lookup seam for named structural types, implemented by the runtime state.
pub trait TypeLookup {
    fn lookup_type(&self, name: &str) -> Option<&StructuralType>;
}

/// Empty type table, for contexts with no named types in scope.
pub struct NoTypes;

impl TypeLookup for NoTypes {
    fn lookup_type(&self, _name: &str) -> Option<&StructuralType> {
        None
    }
}

impl TypeLookup for ahash::AHashMap<String, StructuralType> {
    fn lookup_type(&self, name: &str) -> Option<&StructuralType> {
        self.get(name)
    }
}

/// The ok/err split of a wrapped value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueData {
    Ok(Payload),
    Err(ErrorDetails),
}

/// The runtime's unit of data: payload plus origin, declared type, error
/// state, async linkage, and binding flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedValue {
    pub data: ValueData,
    pub declared_type: Option<DeclaredType>,
    pub source: ValueSource,
    /// Links the value to a scheduler entry while the result is pending.
    #[serde(default)]
    pub async_handle: Option<OpId>,
    #[serde(default)]
    pub is_const: bool,
    #[serde(default)]
    pub is_private: bool,
}

impl WrappedValue {
    /// Wraps a payload with no declared type.
    #[must_use]
    pub fn wrap(payload: Payload, source: ValueSource) -> Self {
        Self {
            data: ValueData::Ok(payload),
            declared_type: None,
            source,
            async_handle: None,
            is_const: false,
            is_private: false,
        }
    }

    /// Wraps a payload against a declared type, running validation and
    /// coercion. Failure is reported as an error detail; the caller decides
    /// whether it is fatal (literal annotation mismatch) or becomes an
    /// errored value.
    pub fn wrap_typed(
        payload: Payload,
        source: ValueSource,
        ty: DeclaredType,
        var_name: &str,
        types: &impl TypeLookup,
    ) -> Result<Self, ErrorDetails> {
        let coerced = validate_and_coerce(payload, &ty, var_name, types)?;
        let mut value = Self::wrap(coerced, source);
        value.declared_type = Some(ty);
        Ok(value)
    }

    /// A null literal value.
    #[must_use]
    pub fn null() -> Self {
        Self::wrap(Payload::Null, ValueSource::Literal)
    }

    /// An errored value. The payload is structurally absent.
    #[must_use]
    pub fn as_error(detail: ErrorDetails) -> Self {
        Self {
            data: ValueData::Err(detail),
            declared_type: None,
            source: ValueSource::Literal,
            async_handle: None,
            is_const: false,
            is_private: false,
        }
    }

    /// A placeholder bound to a scheduler entry; resolves at a join.
    #[must_use]
    pub fn pending(op_id: OpId) -> Self {
        let mut value = Self::null();
        value.async_handle = Some(op_id);
        value
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        matches!(self.data, ValueData::Err(_))
    }

    /// Whether the value is still waiting on a scheduler entry.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.async_handle.is_some()
    }

    /// The payload, or `Payload::Null` for errored values — the view script
    /// code gets when reading any field other than `.err` / `.errDetails`.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        static NULL: Payload = Payload::Null;
        match &self.data {
            ValueData::Ok(payload) => payload,
            ValueData::Err(_) => &NULL,
        }
    }

    #[must_use]
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        match &self.data {
            ValueData::Ok(_) => None,
            ValueData::Err(detail) => Some(detail),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: ValueSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_type(mut self, ty: Option<DeclaredType>) -> Self {
        self.declared_type = ty;
        self
    }
}

/// Validates a payload against a declared type, applying the deterministic
/// coercion table. Returns the (possibly coerced) payload or an error detail
/// naming the variable.
pub fn validate_and_coerce(
    payload: Payload,
    ty: &DeclaredType,
    var_name: &str,
    types: &impl TypeLookup,
) -> Result<Payload, ErrorDetails> {
    // Bindings are nullable: null satisfies every declared type, and the
    // error surfaces where the null is used, not where it is bound.
    if payload.is_null() {
        return Ok(payload);
    }
    let mismatch = |payload: &Payload| {
        ErrorDetails::value_error(format!(
            "cannot assign {} to '{var_name}' declared as {ty}",
            payload.type_name()
        ))
    };
    match ty {
        DeclaredType::Text => match payload {
            Payload::Text(_) => Ok(payload),
            other => Err(mismatch(&other)),
        },
        DeclaredType::Number => match payload {
            Payload::Int(_) => Ok(payload),
            Payload::Float(f) if f.is_finite() => Ok(payload),
            Payload::Float(_) => Err(ErrorDetails::value_error(format!(
                "cannot assign non-finite number to '{var_name}'"
            ))),
            other => Err(mismatch(&other)),
        },
        DeclaredType::Boolean => match payload {
            Payload::Bool(_) => Ok(payload),
            other => Err(mismatch(&other)),
        },
        DeclaredType::Json => match payload {
            Payload::Record(_) | Payload::Seq(_) => Ok(payload),
            // Text coerces structurally: parse on assignment.
            Payload::Text(s) => match serde_json::from_str::<serde_json::Value>(&s) {
                Ok(parsed @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
                    Ok(Payload::from_json(parsed))
                }
                Ok(_) => Err(ErrorDetails::value_error(format!(
                    "'{var_name}' declared as json requires an object or array, got a scalar"
                ))),
                Err(e) => Err(ErrorDetails::value_error(format!(
                    "'{var_name}' declared as json but text does not parse: {e}"
                ))),
            },
            other => Err(mismatch(&other)),
        },
        DeclaredType::Model => match payload {
            Payload::Model(_) => Ok(payload),
            Payload::Record(fields) => ModelDescriptor::from_record(&fields, var_name).map(Payload::Model),
            other => Err(mismatch(&other)),
        },
        DeclaredType::Tool => match payload {
            Payload::Tool(_) => Ok(payload),
            other => Err(mismatch(&other)),
        },
        DeclaredType::Array(elem) => match payload {
            Payload::Seq(items) => {
                let mut coerced = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let element_name = format!("{var_name}[{i}]");
                    coerced.push(validate_and_coerce(item, elem, &element_name, types)?);
                }
                Ok(Payload::Seq(coerced))
            }
            other => Err(mismatch(&other)),
        },
        DeclaredType::Named(name) => {
            let Some(structural) = types.lookup_type(name) else {
                return Err(ErrorDetails::value_error(format!(
                    "unknown type '{name}' on '{var_name}'"
                )));
            };
            let fields = structural.fields.clone();
            match payload {
                Payload::Record(mut record) => {
                    for (field_name, field_ty) in &fields {
                        let Some(field_value) = record.shift_remove(field_name) else {
                            return Err(ErrorDetails::value_error(format!(
                                "'{var_name}' is missing field '{field_name}' required by type {name}"
                            )));
                        };
                        let qualified = format!("{var_name}.{field_name}");
                        let coerced = validate_and_coerce(field_value, field_ty, &qualified, types)?;
                        record.insert(field_name.clone(), coerced);
                    }
                    // Restore declared field order ahead of any extras.
                    let mut ordered = IndexMap::new();
                    for (field_name, _) in &fields {
                        if let Some(v) = record.shift_remove(field_name) {
                            ordered.insert(field_name.clone(), v);
                        }
                    }
                    for (k, v) in record {
                        ordered.insert(k, v);
                    }
                    Ok(Payload::Record(ordered))
                }
                other => Err(mismatch(&other)),
            }
        }
    }
}

/// Infers the type tag recorded on an untyped binding from its payload.
/// Null and ranges stay untagged.
#[must_use]
pub fn infer_declared_type(payload: &Payload) -> Option<DeclaredType> {
    match payload {
        Payload::Null | Payload::Range { .. } => None,
        Payload::Int(_) | Payload::Float(_) => Some(DeclaredType::Number),
        Payload::Bool(_) => Some(DeclaredType::Boolean),
        Payload::Text(_) => Some(DeclaredType::Text),
        Payload::Record(_) | Payload::Seq(_) => Some(DeclaredType::Json),
        Payload::Model(_) => Some(DeclaredType::Model),
        Payload::Tool(_) => Some(DeclaredType::Tool),
    }
}

/// If any input is errored, returns the first errored input's details;
/// otherwise hands the payloads to `op`. This is how every binary operation
/// propagates failures: errors are values, and the first erroring operand
/// wins.
pub fn propagate_errors<'a>(
    inputs: &[&'a WrappedValue],
    op: impl FnOnce(&[&'a Payload]) -> Result<Payload, ErrorDetails>,
) -> WrappedValue {
    for input in inputs {
        if let ValueData::Err(detail) = &input.data {
            return WrappedValue::as_error(detail.clone());
        }
    }
    let payloads: Vec<&Payload> = inputs.iter().map(|v| v.payload()).collect();
    match op(&payloads) {
        Ok(payload) => WrappedValue::wrap(payload, ValueSource::Literal),
        Err(detail) => WrappedValue::as_error(detail),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(pairs: &[(&str, Payload)]) -> Payload {
        Payload::Record(pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect())
    }

    #[test]
    fn errored_value_has_null_payload() {
        let v = WrappedValue::as_error(ErrorDetails::value_error("nope"));
        assert!(v.is_errored());
        assert_eq!(*v.payload(), Payload::Null);
    }

    #[test]
    fn declared_type_parses_arrays_and_named() {
        assert_eq!("text".parse::<DeclaredType>().unwrap(), DeclaredType::Text);
        assert_eq!(
            "number[]".parse::<DeclaredType>().unwrap(),
            DeclaredType::Array(Box::new(DeclaredType::Number))
        );
        assert_eq!(
            "Person".parse::<DeclaredType>().unwrap(),
            DeclaredType::Named("Person".to_owned())
        );
        assert!("model[]".parse::<DeclaredType>().is_err());
    }

    #[test]
    fn null_satisfies_every_declared_type() {
        for ty in [DeclaredType::Text, DeclaredType::Number, DeclaredType::Model] {
            assert_eq!(
                validate_and_coerce(Payload::Null, &ty, "x", &NoTypes).unwrap(),
                Payload::Null
            );
        }
    }

    #[test]
    fn number_rejects_nan_and_infinity() {
        assert!(validate_and_coerce(Payload::Float(1.5), &DeclaredType::Number, "x", &NoTypes).is_ok());
        assert!(validate_and_coerce(Payload::Float(f64::NAN), &DeclaredType::Number, "x", &NoTypes).is_err());
        assert!(validate_and_coerce(Payload::Float(f64::INFINITY), &DeclaredType::Number, "x", &NoTypes).is_err());
    }

    #[test]
    fn boolean_rejects_truthy_coercion() {
        assert!(validate_and_coerce(Payload::Int(1), &DeclaredType::Boolean, "x", &NoTypes).is_err());
        assert!(validate_and_coerce(Payload::Text(String::new()), &DeclaredType::Boolean, "x", &NoTypes).is_err());
    }

    #[test]
    fn json_parses_from_text_on_assignment() {
        let coerced = validate_and_coerce(
            Payload::Text(r#"{"a": 1}"#.to_owned()),
            &DeclaredType::Json,
            "x",
            &NoTypes,
        )
        .unwrap();
        assert_eq!(coerced, record(&[("a", Payload::Int(1))]));

        let scalar = validate_and_coerce(Payload::Text("42".to_owned()), &DeclaredType::Json, "x", &NoTypes);
        assert!(scalar.is_err());
    }

    #[test]
    fn array_recurses_into_elements() {
        let ok = validate_and_coerce(
            Payload::Seq(vec![Payload::Int(1), Payload::Int(2)]),
            &DeclaredType::Array(Box::new(DeclaredType::Number)),
            "xs",
            &NoTypes,
        );
        assert!(ok.is_ok());
        let bad = validate_and_coerce(
            Payload::Seq(vec![Payload::Int(1), Payload::Text("two".to_owned())]),
            &DeclaredType::Array(Box::new(DeclaredType::Number)),
            "xs",
            &NoTypes,
        );
        let err = bad.unwrap_err();
        assert!(err.message.contains("xs[1]"), "{}", err.message);
    }

    #[test]
    fn model_requires_name_and_api_key() {
        let complete = record(&[
            ("name", Payload::Text("gpt-test".to_owned())),
            ("api_key", Payload::Text("sk-123".to_owned())),
        ]);
        let coerced = validate_and_coerce(complete, &DeclaredType::Model, "m", &NoTypes).unwrap();
        assert!(matches!(coerced, Payload::Model(m) if m.name == "gpt-test"));

        let missing = record(&[("name", Payload::Text("gpt-test".to_owned()))]);
        assert!(validate_and_coerce(missing, &DeclaredType::Model, "m", &NoTypes).is_err());
    }

    #[test]
    fn named_type_checks_fields_recursively() {
        let mut types = ahash::AHashMap::new();
        types.insert(
            "Person".to_owned(),
            StructuralType {
                name: "Person".to_owned(),
                fields: vec![
                    ("name".to_owned(), DeclaredType::Text),
                    ("age".to_owned(), DeclaredType::Number),
                ],
            },
        );
        let good = record(&[
            ("name", Payload::Text("Alice".to_owned())),
            ("age", Payload::Int(30)),
        ]);
        assert!(validate_and_coerce(good, &DeclaredType::Named("Person".to_owned()), "p", &types).is_ok());

        let missing = record(&[("name", Payload::Text("Alice".to_owned()))]);
        let err = validate_and_coerce(missing, &DeclaredType::Named("Person".to_owned()), "p", &types).unwrap_err();
        assert!(err.message.contains("age"), "{}", err.message);
    }

    #[test]
    fn propagate_errors_returns_first_errored_operand() {
        let a = WrappedValue::as_error(ErrorDetails::value_error("first"));
        let b = WrappedValue::as_error(ErrorDetails::value_error("second"));
        let out = propagate_errors(&[&a, &b], |_| Ok(Payload::Null));
        assert_eq!(out.error_details().unwrap().message, "first");
    }

    #[test]
    fn payload_json_round_trip_preserves_field_order() {
        let payload = record(&[
            ("z", Payload::Int(1)),
            ("a", Payload::Int(2)),
            ("m", Payload::Seq(vec![Payload::Bool(true), Payload::Null])),
        ]);
        let json = payload.to_json();
        let back = Payload::from_json(json);
        assert_eq!(back, payload);
    }
}
