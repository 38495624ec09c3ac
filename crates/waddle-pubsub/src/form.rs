//! XEP-0004 data forms, reduced to the fields the engine reads and writes.
//!
//! Wire rendering (labels, field types, options) belongs to the protocol
//! layer. The engine only needs `var` names and their values.

use serde::{Deserialize, Serialize};

/// Form type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormType {
    /// Form to be filled in
    Form,
    /// Completed form
    Submit,
    /// Cancelled form
    Cancel,
    /// Form carrying results
    Result,
}

/// A single form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    /// Field variable name (e.g. `pubsub#max_items`).
    pub var: String,
    /// Field values, in order.
    pub values: Vec<String>,
}

impl FormField {
    /// Create a field with the given values.
    pub fn new<I, S>(var: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            var: var.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// First value, if any.
    pub fn first(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    /// Boolean value. A field without values reads as `true`.
    pub fn as_bool(&self) -> bool {
        match self.first() {
            None => true,
            Some(v) => parse_bool(v),
        }
    }

    /// Integer value, defaulting when the field has no value.
    pub fn as_i32_or(&self, default: i32) -> Result<i32, String> {
        match self.first() {
            None => Ok(default),
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| format!("{}: not an integer: {}", self.var, v)),
        }
    }
}

/// A data form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataForm {
    /// Form type.
    pub form_type: FormType,
    /// Value of the hidden `FORM_TYPE` field, if any.
    pub form_namespace: Option<String>,
    /// Remaining fields, in order.
    pub fields: Vec<FormField>,
}

impl DataForm {
    /// Create an empty form of the given type.
    pub fn new(form_type: FormType) -> Self {
        Self {
            form_type,
            form_namespace: None,
            fields: Vec::new(),
        }
    }

    /// Create an empty submitted form.
    pub fn submit() -> Self {
        Self::new(FormType::Submit)
    }

    /// Set the `FORM_TYPE` namespace.
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.form_namespace = Some(ns.into());
        self
    }

    /// Append a field (builder style).
    pub fn with_field<I, S>(mut self, var: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.push(FormField::new(var, values));
        self
    }

    /// Append a field.
    pub fn add_field<I, S>(&mut self, var: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.push(FormField::new(var, values));
    }

    /// Append a boolean field rendered as `1`/`0`.
    pub fn add_bool(&mut self, var: &str, value: bool) {
        self.add_field(var, [bool_value(value)]);
    }

    /// Look up a field by variable name.
    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// First value of a field.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.field(var).and_then(FormField::first)
    }

    /// All values of a field (empty when absent).
    pub fn values(&self, var: &str) -> &[String] {
        self.field(var).map(|f| f.values.as_slice()).unwrap_or(&[])
    }
}

/// Parse an XEP-0004 boolean (`1`/`true` are true).
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true")
}

/// Render an XEP-0004 boolean.
pub fn bool_value(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}
