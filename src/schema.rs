//! Input schema: typed fields, validation, and the pure mapping from field
//! values to command-line tokens.
//!
//! Each adapter declares its inputs as a static slice of [`FieldSpec`]. A
//! single routine ([`validate`]) checks an [`InputRecord`] against that
//! slice, and [`build_args`] turns it into an ordered argument vector.

use crate::error::{AdapterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A single input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text values, or the text items of a list, in order.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Value::Text(s) => vec![s.as_str()],
            Value::List(items) => items.iter().filter_map(Value::as_text).collect(),
            _ => Vec::new(),
        }
    }

    /// Renders a scalar the way it appears on a command line.
    fn render(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format!("{:?}", f),
            Value::Text(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Integer rendering for `%d` placeholders; floats are truncated.
    fn render_int(&self) -> String {
        match self {
            Value::Float(f) => (f.trunc() as i64).to_string(),
            other => other.render(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&Path> for Value {
    fn from(v: &Path) -> Self {
        Value::Text(v.to_string_lossy().to_string())
    }
}

impl From<PathBuf> for Value {
    fn from(v: PathBuf) -> Self {
        Value::Text(v.to_string_lossy().to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

/// What a field holds and how it is rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Boolean emitted as its flag only when true.
    Flag,
    /// Boolean that always emits its flag followed by `y` or `n`.
    YesNo,
    Int,
    Float,
    Text,
    Choice(&'static [&'static str]),
    File,
    Directory,
    FileList,
    IntList,
    FloatList,
    /// Exactly two files filling a two-placeholder template.
    FilePair,
    /// Free-form extra parameters, split on whitespace.
    RawArgs,
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Flag => "flag",
            FieldKind::YesNo => "y/n",
            FieldKind::Int => "int",
            FieldKind::Float => "float",
            FieldKind::Text => "text",
            FieldKind::Choice(_) => "choice",
            FieldKind::File => "file",
            FieldKind::Directory => "directory",
            FieldKind::FileList => "file list",
            FieldKind::IntList => "int list",
            FieldKind::FloatList => "float list",
            FieldKind::FilePair => "file pair",
            FieldKind::RawArgs => "args",
        }
    }

    fn is_list(&self) -> bool {
        matches!(
            self,
            FieldKind::FileList | FieldKind::IntList | FieldKind::FloatList | FieldKind::FilePair
        )
    }
}

/// Default applied when a field is left unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Text(&'static str),
}

impl From<DefaultValue> for Value {
    fn from(v: DefaultValue) -> Self {
        match v {
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::Int(i) => Value::Int(i),
            DefaultValue::Text(s) => Value::Text(s.to_string()),
        }
    }
}

/// Declaration of one input field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Argument template such as `-o %s`; fields without one are never emitted.
    pub template: Option<&'static str>,
    /// Non-negative positions come first, negative ones last (`-1` is final).
    pub position: Option<i32>,
    pub required: bool,
    pub default: Option<DefaultValue>,
    /// Fields that may not be set together with this one.
    pub xor: &'static [&'static str],
    pub sep: &'static str,
    pub min_len: Option<usize>,
    pub max_len: Option<usize>,
    pub must_exist: bool,
    /// When unset, the adapter may generate a value at run time.
    pub generated: bool,
    /// Only the first item of a list value is passed on.
    pub first_only: bool,
    pub desc: &'static str,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            template: None,
            position: None,
            required: false,
            default: None,
            xor: &[],
            sep: " ",
            min_len: None,
            max_len: None,
            must_exist: false,
            generated: false,
            first_only: false,
            desc: "",
        }
    }

    pub const fn arg(self, template: &'static str) -> Self {
        Self {
            template: Some(template),
            ..self
        }
    }

    pub const fn at(self, position: i32) -> Self {
        Self {
            position: Some(position),
            ..self
        }
    }

    pub const fn required(self) -> Self {
        Self {
            required: true,
            ..self
        }
    }

    pub const fn default(self, value: DefaultValue) -> Self {
        Self {
            default: Some(value),
            ..self
        }
    }

    pub const fn xor(self, others: &'static [&'static str]) -> Self {
        Self { xor: others, ..self }
    }

    pub const fn sep(self, sep: &'static str) -> Self {
        Self { sep, ..self }
    }

    pub const fn bounds(self, min: usize, max: Option<usize>) -> Self {
        Self {
            min_len: Some(min),
            max_len: max,
            ..self
        }
    }

    pub const fn exists(self) -> Self {
        Self {
            must_exist: true,
            ..self
        }
    }

    pub const fn generated(self) -> Self {
        Self {
            generated: true,
            ..self
        }
    }

    pub const fn first_only(self) -> Self {
        Self {
            first_only: true,
            ..self
        }
    }

    pub const fn desc(self, desc: &'static str) -> Self {
        Self { desc, ..self }
    }
}

/// The free-form `args` field every command adapter accepts.
pub const EXTRA_ARGS: FieldSpec = FieldSpec::new("args", FieldKind::RawArgs)
    .arg("%s")
    .desc("Additional parameters to the command");

/// Field name to value, as supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputRecord(BTreeMap<String, Value>);

impl InputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_text)
    }

    /// Boolean lookup that falls back to the field's declared default.
    pub fn flag(&self, field: &FieldSpec) -> bool {
        match self.get(field.name) {
            Some(v) => v.as_bool().unwrap_or(false),
            None => matches!(field.default, Some(DefaultValue::Bool(true))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Look up a field declaration by name.
pub fn find_field<'a>(fields: &'a [FieldSpec], name: &str) -> Option<&'a FieldSpec> {
    fields.iter().find(|f| f.name == name)
}

/// Check an input record against a field schema.
///
/// Relative paths of fields that must exist are resolved against `base`.
pub fn validate(fields: &[FieldSpec], inputs: &InputRecord, base: &Path) -> Result<()> {
    for (name, _) in inputs.iter() {
        if find_field(fields, name).is_none() {
            return Err(AdapterError::config(format!("Unknown input `{}`", name)));
        }
    }

    for field in fields {
        let value = inputs.get(field.name);

        if value.is_some() {
            if let Some(other) = field.xor.iter().find(|other| inputs.is_set(other)) {
                return Err(AdapterError::config(format!(
                    "Inputs `{}` and `{}` are mutually exclusive",
                    field.name, other
                )));
            }
        }

        let Some(value) = value else {
            if field.required && !field.xor.iter().any(|other| inputs.is_set(other)) {
                let mut msg = format!("Missing required input `{}`", field.name);
                if !field.xor.is_empty() {
                    msg.push_str(&format!(" (or one of: {})", field.xor.join(", ")));
                }
                return Err(AdapterError::config(msg));
            }
            continue;
        };

        check_kind(field, value)?;
        if field.must_exist {
            check_exists(field, value, base)?;
        }
    }

    Ok(())
}

fn type_error(field: &FieldSpec, value: &Value) -> AdapterError {
    AdapterError::config(format!(
        "Input `{}` expects {}, got {:?}",
        field.name,
        field.kind.type_name(),
        value
    ))
}

fn check_kind(field: &FieldSpec, value: &Value) -> Result<()> {
    let ok = match (field.kind, value) {
        (FieldKind::Flag | FieldKind::YesNo, Value::Bool(_)) => true,
        (FieldKind::Int, Value::Int(_)) => true,
        (FieldKind::Float, Value::Int(_) | Value::Float(_)) => true,
        (
            FieldKind::Text | FieldKind::File | FieldKind::Directory | FieldKind::RawArgs,
            Value::Text(_),
        ) => true,
        (FieldKind::Choice(allowed), Value::Text(_) | Value::Int(_)) => {
            let rendered = value.render();
            if !allowed.contains(&rendered.as_str()) {
                return Err(AdapterError::config(format!(
                    "Input `{}` must be one of [{}], got `{}`",
                    field.name,
                    allowed.join(", "),
                    rendered
                )));
            }
            true
        }
        // A single file is accepted where a list of files is expected.
        (FieldKind::FileList, Value::Text(_)) => true,
        (FieldKind::FileList | FieldKind::FilePair, Value::List(items)) => {
            items.iter().all(|i| matches!(i, Value::Text(_)))
        }
        (FieldKind::IntList, Value::List(items)) => items.iter().all(|i| matches!(i, Value::Int(_))),
        (FieldKind::FloatList, Value::List(items)) => items
            .iter()
            .all(|i| matches!(i, Value::Int(_) | Value::Float(_))),
        _ => false,
    };
    if !ok {
        return Err(type_error(field, value));
    }

    if field.kind.is_list() {
        let len = match value {
            Value::List(items) => items.len(),
            _ => 1,
        };
        let min = if field.kind == FieldKind::FilePair {
            Some(2)
        } else {
            field.min_len
        };
        let max = if field.kind == FieldKind::FilePair {
            Some(2)
        } else {
            field.max_len
        };
        if min.is_some_and(|m| len < m) || max.is_some_and(|m| len > m) {
            return Err(AdapterError::config(format!(
                "Input `{}` has {} items, expected between {} and {}",
                field.name,
                len,
                min.unwrap_or(0),
                max.map(|m| m.to_string()).unwrap_or_else(|| "any".into())
            )));
        }
    }
    Ok(())
}

fn check_exists(field: &FieldSpec, value: &Value, base: &Path) -> Result<()> {
    for raw in value.texts() {
        let path = crate::filemanip::absolute(base, raw);
        let present = match field.kind {
            FieldKind::Directory => path.is_dir(),
            _ => path.is_file(),
        };
        if !present {
            return Err(AdapterError::config(format!(
                "Input `{}` refers to a missing {}: {}",
                field.name,
                if field.kind == FieldKind::Directory {
                    "directory"
                } else {
                    "file"
                },
                path.display()
            )));
        }
    }
    Ok(())
}

/// Render one field value into command-line tokens.
///
/// A yes/no field always emits its flag plus `y` or `n`; a plain flag is
/// dropped when false. Lists are joined with the field separator, except a
/// single-space separator, which expands into one token per item.
pub fn format_field(field: &FieldSpec, value: &Value) -> Vec<String> {
    let Some(template) = field.template else {
        return Vec::new();
    };
    if field.first_only {
        if let Value::List(items) = value {
            return items
                .first()
                .map(|first| fill_template(template, field, first))
                .unwrap_or_default();
        }
    }
    let flag_tokens = || template.split_whitespace().map(str::to_string).collect::<Vec<_>>();

    match field.kind {
        FieldKind::Flag => {
            if value.as_bool().unwrap_or(false) {
                flag_tokens()
            } else {
                Vec::new()
            }
        }
        FieldKind::YesNo => {
            let mut tokens = flag_tokens();
            let answer = if value.as_bool().unwrap_or(false) { "y" } else { "n" };
            tokens.push(answer.to_string());
            tokens
        }
        FieldKind::RawArgs => value.render().split_whitespace().map(str::to_string).collect(),
        _ => fill_template(template, field, value),
    }
}

fn fill_template(template: &str, field: &FieldSpec, value: &Value) -> Vec<String> {
    let placeholders = template.matches("%s").count() + template.matches("%d").count();
    let items: Vec<Value> = match value {
        Value::List(items) => items.clone(),
        other => vec![other.clone()],
    };

    // One value per placeholder, or the whole list in a single slot.
    let slots: Vec<Vec<String>> = if placeholders > 1 {
        items.iter().map(|v| vec![v.render()]).collect()
    } else if field.sep == " " {
        vec![items.iter().map(Value::render).collect()]
    } else {
        vec![vec![items
            .iter()
            .map(Value::render)
            .collect::<Vec<_>>()
            .join(field.sep)]]
    };

    let mut slots = slots.into_iter();
    let mut tokens = Vec::new();
    for token in template.split_whitespace() {
        if token.contains("%d") {
            let rendered = match value {
                Value::List(_) => slots.next().unwrap_or_default(),
                scalar => {
                    slots.next();
                    vec![scalar.render_int()]
                }
            };
            tokens.extend(rendered.into_iter().map(|r| token.replacen("%d", &r, 1)));
        } else if token.contains("%s") {
            let rendered = slots.next().unwrap_or_default();
            tokens.extend(rendered.into_iter().map(|r| token.replacen("%s", &r, 1)));
        } else {
            tokens.push(token.to_string());
        }
    }
    tokens
}

/// Validate `inputs` and assemble the ordered argument vector.
///
/// Fields are emitted by ascending non-negative position, then unpositioned
/// fields in declaration order, then negative positions ascending. Ties keep
/// declaration order. Unset generated fields take their value from
/// `generate`; other unset fields use their default, if any.
pub fn build_args<F>(
    fields: &[FieldSpec],
    inputs: &InputRecord,
    base: &Path,
    generate: F,
) -> Result<Vec<String>>
where
    F: Fn(&FieldSpec) -> Option<Value>,
{
    validate(fields, inputs, base)?;

    let mut leading: Vec<(i32, usize, Vec<String>)> = Vec::new();
    let mut middle: Vec<Vec<String>> = Vec::new();
    let mut trailing: Vec<(i32, usize, Vec<String>)> = Vec::new();

    for (idx, field) in fields.iter().enumerate() {
        if field.template.is_none() {
            continue;
        }
        let value = match inputs.get(field.name) {
            Some(v) => Some(v.clone()),
            None if field.generated => generate(field),
            None => field.default.map(Value::from),
        };
        let Some(value) = value else { continue };

        let tokens = format_field(field, &value);
        if tokens.is_empty() {
            continue;
        }
        match field.position {
            Some(p) if p >= 0 => leading.push((p, idx, tokens)),
            Some(p) => trailing.push((p, idx, tokens)),
            None => middle.push(tokens),
        }
    }

    leading.sort_by_key(|(p, idx, _)| (*p, *idx));
    trailing.sort_by_key(|(p, idx, _)| (*p, *idx));

    let mut args = Vec::new();
    args.extend(leading.into_iter().flat_map(|(_, _, t)| t));
    args.extend(middle.into_iter().flatten());
    args.extend(trailing.into_iter().flat_map(|(_, _, t)| t));
    Ok(args)
}

/// Parse command-line text into a value of the field's kind.
///
/// List kinds split on commas.
pub fn parse_value(field: &FieldSpec, text: &str) -> Result<Value> {
    let bad = || {
        AdapterError::config(format!(
            "Cannot parse `{}` as {} for input `{}`",
            text,
            field.kind.type_name(),
            field.name
        ))
    };
    let split = || text.split(',').map(str::trim).filter(|s| !s.is_empty());

    Ok(match field.kind {
        FieldKind::Flag | FieldKind::YesNo => match text.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Value::Bool(true),
            "false" | "no" | "n" | "0" | "off" => Value::Bool(false),
            _ => return Err(bad()),
        },
        FieldKind::Int => Value::Int(text.trim().parse().map_err(|_| bad())?),
        FieldKind::Float => Value::Float(text.trim().parse().map_err(|_| bad())?),
        FieldKind::Text
        | FieldKind::Choice(_)
        | FieldKind::File
        | FieldKind::Directory
        | FieldKind::RawArgs => Value::Text(text.to_string()),
        FieldKind::FileList | FieldKind::FilePair => {
            Value::List(split().map(|s| Value::Text(s.to_string())).collect())
        }
        FieldKind::IntList => Value::List(
            split()
                .map(|s| s.parse::<i64>().map(Value::Int).map_err(|_| bad()))
                .collect::<Result<Vec<_>>>()?,
        ),
        FieldKind::FloatList => Value::List(
            split()
                .map(|s| s.parse::<f64>().map(Value::Float).map_err(|_| bad()))
                .collect::<Result<Vec<_>>>()?,
        ),
    })
}
