//! Structural and security validation of untrusted game documents.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::GameDocument;
use crate::sanitize::{self, canonicalize_path, sanitize_text};
use crate::schema::{
    self, ANIMATION_FIELDS, FieldKind, FieldSpec, LAYER_FIELDS, LAYOUT_FIELDS,
    MAX_DOCUMENT_BYTES, MAX_NESTING_DEPTH, OBJECT_FIELDS, PROPERTY_FIELDS, Presence,
    RESOURCE_FIELDS, ROOT_FIELDS, VARIABLE_FIELDS,
};

/// Machine-readable category of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCode {
    MissingField,
    WrongType,
    InvalidEnum,
    DuplicateName,
    TypeMismatch,
    UnknownObjectType,
    NoLayouts,
    NoLayers,
    NestingTooDeep,
    DocumentTooLarge,
    InvalidUuid,
    MissingProperty,
    UnsafeText,
    UnsafePath,
    DisallowedExtension,
    OutOfRange,
    TooManyItems,
    InvalidPackageName,
}

impl ValidationCode {
    /// Whether [`sanitize`](crate::sanitize::sanitize) corrects this issue.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::MissingProperty
                | Self::UnsafeText
                | Self::UnsafePath
                | Self::DisallowedExtension
                | Self::OutOfRange
                | Self::TooManyItems
                | Self::InvalidPackageName
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingField => "missing_field",
            Self::WrongType => "wrong_type",
            Self::InvalidEnum => "invalid_enum",
            Self::DuplicateName => "duplicate_name",
            Self::TypeMismatch => "type_mismatch",
            Self::UnknownObjectType => "unknown_object_type",
            Self::NoLayouts => "no_layouts",
            Self::NoLayers => "no_layers",
            Self::NestingTooDeep => "nesting_too_deep",
            Self::DocumentTooLarge => "document_too_large",
            Self::InvalidUuid => "invalid_uuid",
            Self::MissingProperty => "missing_property",
            Self::UnsafeText => "unsafe_text",
            Self::UnsafePath => "unsafe_path",
            Self::DisallowedExtension => "disallowed_extension",
            Self::OutOfRange => "out_of_range",
            Self::TooManyItems => "too_many_items",
            Self::InvalidPackageName => "invalid_package_name",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single rule violation, located by a dotted field path
/// (`layouts[0].layers[1].visibility`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub code: ValidationCode,
    pub message: String,
}

impl ValidationError {
    fn new(path: impl Into<String>, code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            code,
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document rejected with {} violation(s)", .0.len())]
    Rejected(Vec<ValidationError>),
    #[error("document could not be decoded: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl DocumentError {
    /// The violated rules, empty for decoding failures.
    pub fn violations(&self) -> &[ValidationError] {
        match self {
            Self::Rejected(errors) => errors,
            Self::Malformed(_) => &[],
        }
    }
}

/// Report every rule `document` violates, recoverable ones included.
///
/// Oversized or over-nested documents are reported without walking their
/// contents.
pub fn validate(document: &Value) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let Some(root) = document.as_object() else {
        errors.push(ValidationError::new(
            "",
            ValidationCode::WrongType,
            "document must be a JSON object",
        ));
        return errors;
    };

    let size = document.to_string().len();
    if size > MAX_DOCUMENT_BYTES {
        errors.push(ValidationError::new(
            "",
            ValidationCode::DocumentTooLarge,
            format!("document is {size} bytes, limit is {MAX_DOCUMENT_BYTES}"),
        ));
        return errors;
    }

    let depth = nesting_depth(document);
    if depth > MAX_NESTING_DEPTH {
        errors.push(ValidationError::new(
            "",
            ValidationCode::NestingTooDeep,
            format!("document nests {depth} levels deep, limit is {MAX_NESTING_DEPTH}"),
        ));
        return errors;
    }

    let mut walker = Walker { errors };
    walker.fields(root, ROOT_FIELDS, "");

    if let Some(Value::Object(properties)) = root.get("properties") {
        walker.fields(properties, PROPERTY_FIELDS, "properties");
    }
    if let Some(resources) = root.get("resources") {
        walker.resources(resources);
    }
    if let Some(Value::Array(objects)) = root.get("objects") {
        walker.objects(objects);
    }
    if let Some(Value::Array(layouts)) = root.get("layouts") {
        walker.layouts(layouts);
    }
    if let Some(Value::Array(variables)) = root.get("variables") {
        walker.variables(variables, "variables");
    }

    walker.errors
}

/// Depth of the deepest container, measured with an explicit stack.
pub fn nesting_depth(document: &Value) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(document, 0usize)];
    while let Some((value, depth)) = stack.pop() {
        let children: Box<dyn Iterator<Item = &Value>> = match value {
            Value::Array(items) => Box::new(items.iter()),
            Value::Object(map) => Box::new(map.values()),
            _ => continue,
        };
        deepest = deepest.max(depth);
        stack.extend(
            children
                .filter(|child| child.is_array() || child.is_object())
                .map(|child| (child, depth + 1)),
        );
    }
    deepest
}

pub fn is_valid(document: &Value) -> bool {
    validate(document).is_empty()
}

/// Fail with every violation unless `document` is fully valid as-is.
pub fn ensure_valid(document: &Value) -> Result<(), DocumentError> {
    let errors = validate(document);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DocumentError::Rejected(errors))
    }
}

/// Reject on structural errors, otherwise correct recoverable issues and
/// return the sanitised tree.
pub fn validate_and_sanitize_tree(document: Value) -> Result<Value, DocumentError> {
    let report = validate(&document);
    sanitize_reported(document, &report)
}

/// Second half of [`validate_and_sanitize_tree`] for callers that already
/// hold the [`validate`] report of `document`, e.g. from a cache.
pub fn sanitize_reported(
    document: Value,
    report: &[ValidationError],
) -> Result<Value, DocumentError> {
    let fatal: Vec<_> = report
        .iter()
        .filter(|e| !e.is_recoverable())
        .cloned()
        .collect();
    if !fatal.is_empty() {
        tracing::debug!(violations = fatal.len(), "document rejected before sanitising");
        return Err(DocumentError::Rejected(fatal));
    }

    let sanitized = sanitize::sanitize(document);
    // Sanitising can empty out a required name.
    let remaining = validate(&sanitized);
    if !remaining.is_empty() {
        tracing::debug!(violations = remaining.len(), "document rejected after sanitising");
        return Err(DocumentError::Rejected(remaining));
    }
    Ok(sanitized)
}

/// [`validate_and_sanitize_tree`] followed by conversion to the typed model.
pub fn validate_and_sanitize(document: Value) -> Result<GameDocument, DocumentError> {
    let tree = validate_and_sanitize_tree(document)?;
    Ok(serde_json::from_value(tree)?)
}

struct Walker {
    errors: Vec<ValidationError>,
}

impl Walker {
    fn push(&mut self, path: &str, code: ValidationCode, message: impl Into<String>) {
        self.errors.push(ValidationError::new(path, code, message));
    }

    fn fields(&mut self, map: &Map<String, Value>, specs: &[FieldSpec], base: &str) {
        for spec in specs {
            let path = join(base, spec.name);
            match map.get(spec.name) {
                None | Some(Value::Null) => match spec.presence {
                    Presence::Required => self.push(
                        &path,
                        ValidationCode::MissingField,
                        format!("missing required field `{}`", spec.name),
                    ),
                    Presence::Defaulted(_) => self.push(
                        &path,
                        ValidationCode::MissingProperty,
                        format!("`{}` is missing and will be generated", spec.name),
                    ),
                    Presence::Optional => {},
                },
                Some(value) => self.field(value, spec, &path),
            }
        }
    }

    fn field(&mut self, value: &Value, spec: &FieldSpec, path: &str) {
        if let Presence::Defaulted(_) = spec.presence
            && value.as_str().is_some_and(|s| s.trim().is_empty())
        {
            self.push(
                path,
                ValidationCode::MissingProperty,
                format!("`{}` is empty and will be generated", spec.name),
            );
            return;
        }

        match spec.kind {
            FieldKind::Text | FieldKind::Identifier => {
                let Some(text) = value.as_str() else {
                    return self.push(path, ValidationCode::WrongType, "expected a string");
                };
                if matches!(spec.kind, FieldKind::Identifier) && text.trim().is_empty() {
                    return self.push(
                        path,
                        ValidationCode::MissingField,
                        format!("`{}` must not be empty", spec.name),
                    );
                }
                if sanitize_text(text) != text {
                    self.push(
                        path,
                        ValidationCode::UnsafeText,
                        "contains markup, quotes, script URLs or excess length",
                    );
                }
            },
            FieldKind::Boolean => {
                if !value.is_boolean() {
                    self.push(path, ValidationCode::WrongType, "expected a boolean");
                }
            },
            FieldKind::Integer { min, max } => {
                let Some(clamped) = sanitize::clamp_integer(value, min, max) else {
                    return self.push(path, ValidationCode::WrongType, "expected a number");
                };
                if !(value.is_i64() || value.is_u64()) || value.as_i64() != Some(clamped) {
                    self.push(
                        path,
                        ValidationCode::OutOfRange,
                        format!("must be an integer in {min}..={max}"),
                    );
                }
            },
            FieldKind::Enum(allowed) => match value.as_str() {
                None => self.push(path, ValidationCode::WrongType, "expected a string"),
                Some(s) if !allowed.contains(&s) => self.push(
                    path,
                    ValidationCode::InvalidEnum,
                    format!("`{s}` is not one of: {}", allowed.join(", ")),
                ),
                Some(_) => {},
            },
            FieldKind::Array { cap } => match value.as_array() {
                None => self.push(path, ValidationCode::WrongType, "expected an array"),
                Some(items) => self.cap(items, cap, path),
            },
            FieldKind::ResourceList { cap } => {
                let items = value
                    .as_array()
                    .or_else(|| value.get("resources").and_then(Value::as_array));
                match items {
                    None => self.push(path, ValidationCode::WrongType, "expected an array"),
                    Some(items) => self.cap(items, Some(cap), path),
                }
            },
            FieldKind::Object => {
                if !value.is_object() {
                    self.push(path, ValidationCode::WrongType, "expected an object");
                }
            },
            FieldKind::Uuid => match value.as_str() {
                None => self.push(path, ValidationCode::WrongType, "expected a string"),
                Some(s) if !schema::is_uuid_v4(s) => {
                    self.push(path, ValidationCode::InvalidUuid, "must be a UUID v4")
                },
                Some(_) => {},
            },
            FieldKind::PackageName => match value.as_str() {
                None => self.push(path, ValidationCode::WrongType, "expected a string"),
                Some(s) if !schema::is_valid_package_name(s) => self.push(
                    path,
                    ValidationCode::InvalidPackageName,
                    format!("`{s}` is not a valid package name"),
                ),
                Some(_) => {},
            },
            FieldKind::ResourcePath => {
                let Some(file) = value.as_str() else {
                    return self.push(path, ValidationCode::WrongType, "expected a string");
                };
                if canonicalize_path(file) != file {
                    self.push(
                        path,
                        ValidationCode::UnsafePath,
                        "path must be relative without traversal segments",
                    );
                }
                if !schema::has_allowed_extension(file) {
                    self.push(
                        path,
                        ValidationCode::DisallowedExtension,
                        format!("`{file}` does not have an allowed extension"),
                    );
                }
            },
            FieldKind::ObjectType => match value.as_str() {
                None => self.push(path, ValidationCode::WrongType, "expected a string"),
                Some(s) if s.is_empty() => {
                    self.push(path, ValidationCode::MissingField, "`type` must not be empty")
                },
                Some(s) if !schema::is_known_object_type(s) => self.push(
                    path,
                    ValidationCode::UnknownObjectType,
                    format!("unknown object type `{s}`"),
                ),
                Some(_) => {},
            },
        }
    }

    fn cap(&mut self, items: &[Value], cap: Option<usize>, path: &str) {
        if let Some(cap) = cap
            && items.len() > cap
        {
            self.push(
                path,
                ValidationCode::TooManyItems,
                format!("{} items, at most {cap} are kept", items.len()),
            );
        }
    }

    /// Run `specs` over each object in `items` and report duplicate names.
    /// Items past `cap` are dropped by the sanitiser and not inspected.
    fn named_items<'a>(
        &mut self,
        items: &'a [Value],
        cap: Option<usize>,
        specs: &[FieldSpec],
        base: &str,
        noun: &str,
    ) -> Vec<(String, &'a Map<String, Value>)> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::new();
        for (i, item) in items.iter().take(cap.unwrap_or(usize::MAX)).enumerate() {
            let path = format!("{base}[{i}]");
            let Some(map) = item.as_object() else {
                self.push(&path, ValidationCode::WrongType, format!("{noun} must be an object"));
                continue;
            };
            self.fields(map, specs, &path);
            if let Some(name) = map.get("name").and_then(Value::as_str)
                && !seen.insert(name)
            {
                self.push(
                    &join(&path, "name"),
                    ValidationCode::DuplicateName,
                    format!("duplicate {noun} name `{name}`"),
                );
            }
            nodes.push((path, map));
        }
        nodes
    }

    fn resources(&mut self, resources: &Value) {
        let items = resources
            .as_array()
            .or_else(|| resources.get("resources").and_then(Value::as_array));
        let Some(items) = items else {
            return;
        };
        for (i, item) in items.iter().take(schema::MAX_RESOURCES).enumerate() {
            let path = format!("resources[{i}]");
            match item.as_object() {
                Some(map) => self.fields(map, RESOURCE_FIELDS, &path),
                None => self.push(&path, ValidationCode::WrongType, "resource must be an object"),
            }
        }
    }

    fn objects(&mut self, objects: &[Value]) {
        let nodes = self.named_items(
            objects,
            Some(schema::MAX_OBJECTS),
            OBJECT_FIELDS,
            "objects",
            "object",
        );
        for (path, object) in nodes {
            if let Some(Value::Array(animations)) = object.get("animations") {
                for (i, animation) in animations.iter().take(schema::MAX_ANIMATIONS).enumerate() {
                    let anim_path = format!("{path}.animations[{i}]");
                    match animation.as_object() {
                        Some(map) => self.fields(map, ANIMATION_FIELDS, &anim_path),
                        None => self.push(
                            &anim_path,
                            ValidationCode::WrongType,
                            "animation must be an object",
                        ),
                    }
                }
            }
            if let Some(Value::Array(variables)) = object.get("variables") {
                self.variables(variables, &join(&path, "variables"));
            }
        }
    }

    fn layouts(&mut self, layouts: &[Value]) {
        if layouts.is_empty() {
            self.push("layouts", ValidationCode::NoLayouts, "at least one layout is required");
            return;
        }
        let nodes = self.named_items(
            layouts,
            Some(schema::MAX_LAYOUTS),
            LAYOUT_FIELDS,
            "layouts",
            "layout",
        );
        for (path, layout) in nodes {
            if let Some(Value::Array(layers)) = layout.get("layers") {
                if layers.is_empty() {
                    self.push(
                        &join(&path, "layers"),
                        ValidationCode::NoLayers,
                        "a layout needs at least one layer",
                    );
                }
                self.named_items(
                    layers,
                    Some(schema::MAX_LAYERS),
                    LAYER_FIELDS,
                    &join(&path, "layers"),
                    "layer",
                );
            }
            if let Some(Value::Array(variables)) = layout.get("variables") {
                self.variables(variables, &join(&path, "variables"));
            }
        }
    }

    /// One variable scope. Recursion is bounded by the nesting check.
    fn variables(&mut self, variables: &[Value], base: &str) {
        let nodes = self.named_items(
            variables,
            Some(schema::MAX_VARIABLES),
            VARIABLE_FIELDS,
            base,
            "variable",
        );
        for (path, variable) in nodes {
            let Some(kind) = variable.get("type").and_then(Value::as_str) else {
                continue;
            };
            let value = variable.get("value").filter(|v| !v.is_null());
            let children = variable.get("children").filter(|v| !v.is_null());
            let consistent = match kind {
                "number" => value.is_none_or(Value::is_number) && children.is_none(),
                "string" => value.is_none_or(Value::is_string) && children.is_none(),
                "boolean" => value.is_none_or(Value::is_boolean) && children.is_none(),
                "structure" | "array" => value.is_none(),
                _ => continue,
            };
            if !consistent {
                self.push(
                    &join(&path, "value"),
                    ValidationCode::TypeMismatch,
                    format!("value does not match declared type `{kind}`"),
                );
            }
            if let Some(Value::Array(children)) = children {
                self.variables(children, &join(&path, "children"));
            }
        }
    }
}

fn join(base: &str, field: &str) -> String {
    if base.is_empty() {
        field.to_string()
    } else {
        format!("{base}.{field}")
    }
}
