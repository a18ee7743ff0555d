//! In-place correction of recoverable document issues.
//!
//! [`sanitize`] is total: it never fails and leaves anything it does not
//! understand untouched, so structural errors survive for the validator to
//! report. It is also idempotent.

use serde_json::{Map, Value};

use crate::schema::{
    self, ANIMATION_FIELDS, FALLBACK_PACKAGE_NAME, FieldKind, FieldSpec, LAYER_FIELDS,
    LAYOUT_FIELDS, MAX_TEXT_LEN, OBJECT_FIELDS, PROPERTY_FIELDS, Presence, RESOURCE_FIELDS,
    ROOT_FIELDS, VARIABLE_FIELDS,
};

const SCRIPT_SCHEME: &[u8] = b"javascript:";
const PATH_FORBIDDEN: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Strip markup, quotes and script URLs from free text, trim it and cap it
/// at [`MAX_TEXT_LEN`] characters.
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {},
            '>' | '"' | '\'' => {},
            _ => out.push(c),
        }
    }
    // An unterminated tag swallows the rest of the input.

    // Removing one occurrence can splice together another one.
    while let Some(pos) = find_script_scheme(&out) {
        out.replace_range(pos..pos + SCRIPT_SCHEME.len(), "");
    }

    let trimmed = out.trim();
    if trimmed.chars().count() <= MAX_TEXT_LEN {
        return trimmed.to_string();
    }
    trimmed
        .chars()
        .take(MAX_TEXT_LEN)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn find_script_scheme(s: &str) -> Option<usize> {
    s.as_bytes()
        .windows(SCRIPT_SCHEME.len())
        .position(|w| w.eq_ignore_ascii_case(SCRIPT_SCHEME))
}

/// Make an asset path relative and free of traversal segments.
///
/// Both separators are accepted; the result always uses `/`.
pub fn canonicalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .map(|segment| segment.replace(PATH_FORBIDDEN, ""))
        .filter(|segment| !matches!(segment.as_str(), "" | "." | ".."))
        .collect::<Vec<_>>()
        .join("/")
}

/// Correct every recoverable issue in `document`.
pub fn sanitize(mut document: Value) -> Value {
    let Some(root) = document.as_object_mut() else {
        return document;
    };

    // Unwrap the legacy `{ "resources": [...] }` form before capping.
    if let Some(Value::Object(wrapper)) = root.get_mut("resources")
        && let Some(inner @ Value::Array(_)) = wrapper.remove("resources")
    {
        root.insert("resources".to_string(), inner);
    }

    if let Some(Value::Array(resources)) = root.get_mut("resources") {
        for resource in resources.iter_mut() {
            sanitize_node(resource, RESOURCE_FIELDS);
        }
        resources.retain(|resource| match resource.get("file") {
            Some(Value::String(file)) => schema::has_allowed_extension(file),
            _ => true,
        });
    }
    apply_fields(root, ROOT_FIELDS);

    if let Some(properties) = root.get_mut("properties") {
        sanitize_node(properties, PROPERTY_FIELDS);
    }

    if let Some(Value::Array(objects)) = root.get_mut("objects") {
        for object in objects.iter_mut() {
            sanitize_node(object, OBJECT_FIELDS);
            if let Some(Value::Array(animations)) = object.get_mut("animations") {
                for animation in animations.iter_mut() {
                    sanitize_node(animation, ANIMATION_FIELDS);
                }
            }
            if let Some(Value::Array(variables)) = object.get_mut("variables") {
                sanitize_variables(variables);
            }
        }
    }

    if let Some(Value::Array(layouts)) = root.get_mut("layouts") {
        for layout in layouts.iter_mut() {
            sanitize_node(layout, LAYOUT_FIELDS);
            if let Some(Value::Array(layers)) = layout.get_mut("layers") {
                for layer in layers.iter_mut() {
                    sanitize_node(layer, LAYER_FIELDS);
                }
            }
            if let Some(Value::Array(variables)) = layout.get_mut("variables") {
                sanitize_variables(variables);
            }
        }
    }

    if let Some(Value::Array(variables)) = root.get_mut("variables") {
        sanitize_variables(variables);
    }

    document
}

/// Variables nest through `children`; walk them with an explicit stack.
fn sanitize_variables(variables: &mut Vec<Value>) {
    let mut pending = vec![variables];
    while let Some(scope) = pending.pop() {
        for variable in scope.iter_mut() {
            sanitize_node(variable, VARIABLE_FIELDS);
        }
        for variable in scope {
            if let Value::Object(map) = variable
                && let Some(Value::Array(children)) = map.get_mut("children")
            {
                pending.push(children);
            }
        }
    }
}

fn sanitize_node(node: &mut Value, specs: &[FieldSpec]) {
    if let Value::Object(map) = node {
        apply_fields(map, specs);
    }
}

fn apply_fields(map: &mut Map<String, Value>, specs: &[FieldSpec]) {
    for spec in specs {
        let present = map.get(spec.name).is_some_and(|v| !v.is_null());
        if !present {
            match spec.presence {
                Presence::Defaulted(fill) => {
                    map.insert(spec.name.to_string(), fill());
                },
                // An explicit null reads the same as an absent optional field.
                Presence::Optional => {
                    map.remove(spec.name);
                },
                Presence::Required => {},
            }
            continue;
        }
        let Some(value) = map.get_mut(spec.name) else {
            continue;
        };
        sanitize_field(value, spec);
        if let Presence::Defaulted(fill) = spec.presence
            && value.as_str().is_some_and(|s| s.trim().is_empty())
        {
            *value = fill();
        }
    }
}

fn sanitize_field(value: &mut Value, spec: &FieldSpec) {
    match spec.kind {
        FieldKind::Text | FieldKind::Identifier => {
            if let Value::String(s) = value {
                *s = sanitize_text(s);
            }
        },
        FieldKind::Integer { min, max } => {
            if let Some(clamped) = clamp_integer(value, min, max) {
                *value = Value::from(clamped);
            }
        },
        FieldKind::Array { cap: Some(cap) } | FieldKind::ResourceList { cap } => {
            if let Value::Array(items) = value {
                items.truncate(cap);
            }
        },
        FieldKind::PackageName => {
            if let Value::String(s) = value
                && !schema::is_valid_package_name(s)
            {
                *s = FALLBACK_PACKAGE_NAME.to_string();
            }
        },
        FieldKind::ResourcePath => {
            if let Value::String(s) = value {
                *s = canonicalize_path(s);
            }
        },
        FieldKind::Boolean
        | FieldKind::Enum(_)
        | FieldKind::Array { cap: None }
        | FieldKind::Object
        | FieldKind::Uuid
        | FieldKind::ObjectType => {},
    }
}

/// Clamped integral value, or `None` when `value` is not a number.
pub(crate) fn clamp_integer(value: &Value, min: i64, max: i64) -> Option<i64> {
    let n = if let Some(i) = value.as_i64() {
        i
    } else if value.is_u64() {
        i64::MAX
    } else {
        // Float to int casts saturate.
        value.as_f64()?.round() as i64
    };
    Some(n.clamp(min, max))
}
