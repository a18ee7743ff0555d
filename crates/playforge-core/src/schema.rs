//! Schema tables describing the game document wire format.
//!
//! Every node the validator inspects is described by a slice of
//! [`FieldSpec`]s. The validator and the sanitiser both walk these tables, so
//! a field's type, bounds and recovery behaviour are declared in exactly one
//! place.

use serde_json::Value;

/// Maximum serialised size of a document in bytes.
pub const MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;
/// Maximum container nesting depth. The root object is depth 0.
pub const MAX_NESTING_DEPTH: usize = 10;
/// Maximum length, in characters, of any free-text field after sanitisation.
pub const MAX_TEXT_LEN: usize = 1000;

pub const MAX_RESOURCES: usize = 1000;
pub const MAX_OBJECTS: usize = 1000;
pub const MAX_VARIABLES: usize = 1000;
pub const MAX_LAYOUTS: usize = 100;
pub const MAX_LAYERS: usize = 20;
pub const MAX_BEHAVIORS: usize = 50;
pub const MAX_ANIMATIONS: usize = 100;
pub const MAX_EVENTS: usize = 1000;
pub const MAX_INSTANCES: usize = 1000;

pub const ORIENTATIONS: &[&str] = &["default", "landscape", "portrait"];
pub const SIZE_ON_STARTUP_MODES: &[&str] = &["adaptWidth", "adaptHeight", "noChanges"];
pub const ANTIALIASING_MODES: &[&str] = &["MSAA", "none"];
pub const VARIABLE_TYPES: &[&str] = &["number", "string", "boolean", "structure", "array"];

/// Object types the toolchain ships natively. Extension types are
/// namespaced (`Extension::Type`) and accepted as-is.
pub const BUILTIN_OBJECT_TYPES: &[&str] = &[
    "Sprite",
    "TextObject::Text",
    "TiledSpriteObject::TiledSprite",
    "PanelSpriteObject::PanelSprite",
];

/// Resource file extensions (lowercase) that may be referenced by a document.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "mp3", "wav", "ogg", "json", "ttf", "otf",
];

/// Package name substituted for an invalid one.
pub const FALLBACK_PACKAGE_NAME: &str = "com.example.game";
/// Version filled in when a document omits one.
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Shape of a single field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Free text. Sanitised in place.
    Text,
    /// Non-empty free text used as a name.
    Identifier,
    Boolean,
    /// Integral number clamped into `[min, max]`.
    Integer { min: i64, max: i64 },
    Enum(&'static [&'static str]),
    /// Array truncated to `cap` items when a cap is given.
    Array { cap: Option<usize> },
    Object,
    /// The resource list: an array, or the legacy `{ "resources": [...] }`
    /// wrapper which the sanitiser unwraps.
    ResourceList { cap: usize },
    /// Hyphenated UUID v4.
    Uuid,
    /// Reverse-domain package identifier.
    PackageName,
    /// Relative asset path with an allow-listed extension.
    ResourcePath,
    /// Object type, built-in or namespaced extension type.
    ObjectType,
}

/// What happens when a field is absent (or `null`).
#[derive(Debug, Clone, Copy)]
pub enum Presence {
    /// Absence is a structural error.
    Required,
    /// Absence is recoverable; the sanitiser fills in the produced value.
    Defaulted(fn() -> Value),
    Optional,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub presence: Presence,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        presence: Presence::Required,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        presence: Presence::Optional,
    }
}

const fn defaulted(name: &'static str, kind: FieldKind, fill: fn() -> Value) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        presence: Presence::Defaulted(fill),
    }
}

fn default_version() -> Value {
    Value::String(DEFAULT_VERSION.to_string())
}

fn fresh_uuid() -> Value {
    Value::String(uuid::Uuid::new_v4().to_string())
}

const fn capped(cap: usize) -> FieldKind {
    FieldKind::Array { cap: Some(cap) }
}

const UNCAPPED: FieldKind = FieldKind::Array { cap: None };

pub const ROOT_FIELDS: &[FieldSpec] = &[
    required("properties", FieldKind::Object),
    required("resources", FieldKind::ResourceList { cap: MAX_RESOURCES }),
    required("objects", capped(MAX_OBJECTS)),
    required("layouts", capped(MAX_LAYOUTS)),
    optional("variables", capped(MAX_VARIABLES)),
    optional("objectsGroups", UNCAPPED),
    optional("externalEvents", UNCAPPED),
    optional("eventsFunctionsExtensions", UNCAPPED),
    optional("externalLayouts", UNCAPPED),
    optional("externalSourceFiles", UNCAPPED),
];

pub const PROPERTY_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Identifier),
    defaulted("version", FieldKind::Text, default_version),
    defaulted("projectUuid", FieldKind::Uuid, fresh_uuid),
    optional("description", FieldKind::Text),
    optional("author", FieldKind::Text),
    optional("orientation", FieldKind::Enum(ORIENTATIONS)),
    optional("sizeOnStartupMode", FieldKind::Enum(SIZE_ON_STARTUP_MODES)),
    optional("antialiasingMode", FieldKind::Enum(ANTIALIASING_MODES)),
    optional("windowWidth", FieldKind::Integer { min: 1, max: 4096 }),
    optional("windowHeight", FieldKind::Integer { min: 1, max: 4096 }),
    optional("maxFPS", FieldKind::Integer { min: 30, max: 120 }),
    optional("minFPS", FieldKind::Integer { min: 10, max: 60 }),
    optional("packageName", FieldKind::PackageName),
];

pub const RESOURCE_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Identifier),
    required("file", FieldKind::ResourcePath),
    optional("kind", FieldKind::Text),
];

pub const OBJECT_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Identifier),
    required("type", FieldKind::ObjectType),
    optional("variables", capped(MAX_VARIABLES)),
    optional("behaviors", capped(MAX_BEHAVIORS)),
    optional("animations", capped(MAX_ANIMATIONS)),
];

pub const ANIMATION_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Text),
    required("directions", UNCAPPED),
];

pub const LAYOUT_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Identifier),
    required("layers", capped(MAX_LAYERS)),
    optional("events", capped(MAX_EVENTS)),
    optional("instances", capped(MAX_INSTANCES)),
    optional("variables", capped(MAX_VARIABLES)),
    optional("r", FieldKind::Integer { min: 0, max: 255 }),
    optional("v", FieldKind::Integer { min: 0, max: 255 }),
    optional("b", FieldKind::Integer { min: 0, max: 255 }),
];

pub const LAYER_FIELDS: &[FieldSpec] = &[
    // The toolchain's base layer is conventionally unnamed, so an empty name is fine.
    required("name", FieldKind::Text),
    required("visibility", FieldKind::Boolean),
];

pub const VARIABLE_FIELDS: &[FieldSpec] = &[
    required("name", FieldKind::Identifier),
    required("type", FieldKind::Enum(VARIABLE_TYPES)),
    optional("children", capped(MAX_VARIABLES)),
];

/// Returns the lowercase extension of the last path segment, if any.
pub fn file_extension(path: &str) -> Option<String> {
    let file_name = path.rsplit(['/', '\\']).next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn has_allowed_extension(path: &str) -> bool {
    file_extension(path).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

/// `segment(.segment)+`, each segment `[A-Za-z][A-Za-z0-9_]*`.
pub fn is_valid_package_name(name: &str) -> bool {
    let mut segments = 0;
    for segment in name.split('.') {
        let mut chars = segment.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        if !first.is_ascii_alphabetic() || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Hyphenated, RFC 4122 variant, version 4.
pub fn is_uuid_v4(s: &str) -> bool {
    s.len() == 36
        && uuid::Uuid::try_parse(s)
            .is_ok_and(|u| u.get_version_num() == 4 && u.get_variant() == uuid::Variant::RFC4122)
}

pub fn is_known_object_type(kind: &str) -> bool {
    BUILTIN_OBJECT_TYPES.contains(&kind) || kind.contains("::")
}

/// A section of the human-readable rule catalogue.
#[derive(Debug, Clone, Copy)]
pub struct RuleGroup {
    pub section: &'static str,
    pub rules: &'static [&'static str],
}

/// Human-readable catalogue of the rules applied by the validator.
pub fn validation_rules() -> &'static [RuleGroup] {
    const RULES: &[RuleGroup] = &[
        RuleGroup {
            section: "document",
            rules: &[
                "Required fields: properties, resources, objects, layouts",
                "Serialised size must not exceed 5 MiB",
                "Containers must not nest deeper than 10 levels",
            ],
        },
        RuleGroup {
            section: "properties",
            rules: &[
                "name is required and must not be empty",
                "version defaults to 1.0.0 when missing",
                "projectUuid must be a UUID v4 and is generated when missing",
                "orientation must be one of: default, landscape, portrait",
                "windowWidth and windowHeight are clamped to 1..=4096",
                "maxFPS is clamped to 30..=120 and minFPS to 10..=60",
                "packageName must look like com.example.game",
            ],
        },
        RuleGroup {
            section: "resources",
            rules: &[
                "Each resource needs a name and a file",
                "File paths are made relative and stripped of traversal segments",
                "Only image, audio, font and json files are accepted",
                "At most 1000 resources",
            ],
        },
        RuleGroup {
            section: "objects",
            rules: &[
                "Each object needs a name and a type",
                "Object names must be unique",
                "Animations need a name and a directions array",
                "At most 1000 objects, 50 behaviors and 100 animations per object",
            ],
        },
        RuleGroup {
            section: "layouts",
            rules: &[
                "At least one layout is required",
                "Each layout needs a name and at least one layer",
                "Layout names must be unique, as must layer names within a layout",
                "Each layer needs a name and a boolean visibility",
                "At most 100 layouts, 20 layers, 1000 events and 1000 instances",
            ],
        },
        RuleGroup {
            section: "variables",
            rules: &[
                "Each variable needs a name and a type",
                "Type must be one of: number, string, boolean, structure, array",
                "Variable values must match the declared type",
                "Variable names must be unique within their scope",
            ],
        },
        RuleGroup {
            section: "text",
            rules: &[
                "Markup, quotes and script URLs are stripped from free text",
                "Free text is trimmed and capped at 1000 characters",
            ],
        },
    ];
    RULES
}
