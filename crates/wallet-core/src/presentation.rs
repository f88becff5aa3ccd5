use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Presentation definitions (DIF Presentation Exchange subset)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationDefinition {
    pub id: String,
    #[serde(default)]
    pub input_descriptors: Vec<InputDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Accepted credential formats, keyed by format identifier.
    #[serde(default)]
    pub format: Map<String, Value>,
    #[serde(default)]
    pub constraints: Constraints,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_disclosure: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_to_retain: Option<bool>,
}

impl Field {
    /// Display name: the declared `name`, otherwise the first path.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.path.first().cloned())
            .unwrap_or_default()
    }

    fn is_optional(&self) -> bool {
        self.optional.unwrap_or(false)
    }
}

impl InputDescriptor {
    pub fn accepts_format(&self, format: &str) -> bool {
        self.format.contains_key(format)
    }

    pub fn requested_field_names(&self) -> Vec<String> {
        self.constraints
            .fields
            .iter()
            .map(Field::display_name)
            .collect()
    }

    pub fn all_paths(&self) -> Vec<String> {
        self.constraints
            .fields
            .iter()
            .flat_map(|f| f.path.iter().cloned())
            .collect()
    }

    /// Whether every required field resolves to a value in `claims`.
    pub fn is_satisfied_by(&self, claims: &Value) -> bool {
        self.constraints
            .fields
            .iter()
            .filter(|f| !f.is_optional())
            .all(|field| field_value(field, claims).is_some())
    }
}

/// First value among the field's alternative paths that exists and passes the filter.
pub fn field_value<'a>(field: &Field, claims: &'a Value) -> Option<&'a Value> {
    field.path.iter().find_map(|path| {
        let segments = parse_path(path).ok()?;
        let value = resolve(claims, &segments)?;
        if value.is_null() {
            return None;
        }
        match &field.filter {
            Some(filter) if !filter_accepts(filter, value) => None,
            _ => Some(value),
        }
    })
}

// Supported filter keywords: const, enum, type.
fn filter_accepts(filter: &Value, value: &Value) -> bool {
    if let Some(expected) = filter.get("const") {
        if expected != value {
            return false;
        }
    }
    if let Some(Value::Array(options)) = filter.get("enum") {
        if !options.contains(value) {
            return false;
        }
    }
    if let Some(Value::String(ty)) = filter.get("type") {
        let ok = match ty.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// JSONPath subset: `$`, `.name`, `['name']`, `["name"]`, `[index]`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

pub fn parse_path(path: &str) -> CoreResult<Vec<PathSegment>> {
    let rest = path
        .strip_prefix('$')
        .ok_or_else(|| CoreError::Encoding(format!("path must start with '$': {}", path)))?;
    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                if end == start {
                    return Err(CoreError::Encoding(format!("empty segment in {}", path)));
                }
                segments.push(PathSegment::Key(chars[start..end].iter().collect()));
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| CoreError::Encoding(format!("unclosed bracket in {}", path)))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let quoted = (inner.starts_with('\'') && inner.ends_with('\''))
                    || (inner.starts_with('"') && inner.ends_with('"'));
                if quoted && inner.len() >= 2 {
                    segments.push(PathSegment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index = inner.parse::<usize>().map_err(|_| {
                        CoreError::Encoding(format!("unsupported selector [{}] in {}", inner, path))
                    })?;
                    segments.push(PathSegment::Index(index));
                }
                i = close + 1;
            }
            other => {
                return Err(CoreError::Encoding(format!(
                    "unexpected '{}' in path {}",
                    other, path
                )))
            }
        }
    }
    Ok(segments)
}

pub fn resolve<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| match segment {
        PathSegment::Key(key) => current.get(key.as_str()),
        PathSegment::Index(index) => current.get(*index),
    })
}

/// Build a disclosure frame from paths: `$.a.b` and `$['a']['c']` become
/// `{"a": {"b": true, "c": true}}`.
pub fn presentation_frame(paths: &[String]) -> Value {
    let mut root = Map::new();
    for path in paths {
        let Ok(segments) = parse_path(path) else {
            continue;
        };
        let keys: Vec<&str> = segments
            .iter()
            .filter_map(|s| match s {
                PathSegment::Key(k) => Some(k.as_str()),
                PathSegment::Index(_) => None,
            })
            .collect();
        insert_frame(&mut root, &keys);
    }
    Value::Object(root)
}

fn insert_frame(node: &mut Map<String, Value>, keys: &[&str]) {
    let Some((first, rest)) = keys.split_first() else {
        return;
    };
    if rest.is_empty() {
        node.insert(first.to_string(), Value::Bool(true));
        return;
    }
    let child = node
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(map) = child {
        insert_frame(map, rest);
    }
}

// ---------------------------------------------------------------------------
// Presentation submission
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorMapEntry {
    pub id: String,
    pub format: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationSubmission {
    pub id: String,
    pub definition_id: String,
    pub descriptor_map: Vec<DescriptorMapEntry>,
}
