pub mod document;
pub mod sanitize;
pub mod schema;
pub mod validator;

pub use document::{AssetManifest, GameDocument, content_hash};
pub use validator::{DocumentError, ValidationCode, ValidationError};

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use serde_json::{Value, json};

    /// The smallest document that passes once generated properties are filled in.
    pub fn minimal_document() -> Value {
        json!({
            "properties": { "name": "T" },
            "resources": [],
            "objects": [{ "name": "P", "type": "Sprite" }],
            "layouts": [{ "name": "Main", "layers": [{ "name": "L", "visibility": true }] }],
        })
    }

    /// A fully specified document that validates without any correction.
    pub fn complete_document(name: &str) -> Value {
        json!({
            "properties": {
                "name": name,
                "version": "1.0.0",
                "projectUuid": "3f2b8c1e-9d4a-4c6b-8e2f-1a2b3c4d5e6f",
                "orientation": "landscape",
                "windowWidth": 800,
                "windowHeight": 600,
                "maxFPS": 60,
                "minFPS": 20,
                "packageName": "com.example.game"
            },
            "resources": [{ "name": "hero", "file": "assets/hero.png", "kind": "image" }],
            "objects": [sprite("Player"), { "name": "Score", "type": "TextObject::Text" }],
            "layouts": [layout("Main")],
            "variables": [{ "name": "score", "type": "number", "value": 0 }],
        })
    }

    pub fn sprite(name: &str) -> Value {
        json!({
            "name": name,
            "type": "Sprite",
            "animations": [{ "name": "idle", "directions": [] }]
        })
    }

    pub fn layout(name: &str) -> Value {
        json!({
            "name": name,
            "layers": [{ "name": "", "visibility": true }],
            "events": [],
            "instances": []
        })
    }
}
