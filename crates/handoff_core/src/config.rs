use crate::error::{bridge_error, BridgeError, E_CONFIG};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Names the bridge links under and looks up in the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub import_module: String,
    pub memory_export: String,
    pub length_import: String,
    pub copy_import: String,
    pub release_import: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            import_module: "env".to_string(),
            memory_export: "memory".to_string(),
            length_import: "__len".to_string(),
            copy_import: "__copy".to_string(),
            release_import: "__pop".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(text: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig = serde_json::from_str(text)
            .map_err(|err| bridge_error(E_CONFIG, format!("invalid bridge config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let text = fs::read_to_string(path).map_err(|err| {
            bridge_error(E_CONFIG, format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let fields = [
            ("import_module", &self.import_module),
            ("memory_export", &self.memory_export),
            ("length_import", &self.length_import),
            ("copy_import", &self.copy_import),
            ("release_import", &self.release_import),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(bridge_error(E_CONFIG, format!("{field} must not be empty")));
            }
        }
        let imports = [&self.length_import, &self.copy_import, &self.release_import];
        for (idx, name) in imports.iter().enumerate() {
            if imports[idx + 1..].contains(name) {
                return Err(bridge_error(
                    E_CONFIG,
                    format!("import name '{name}' is used for more than one entry point"),
                ));
            }
        }
        Ok(())
    }
}
