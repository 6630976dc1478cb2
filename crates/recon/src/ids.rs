use regex::Regex;

use crate::config::OwnerIdConfig;
use crate::error::ReconError;

/// Structural validation for owner identifiers, shared by both loaders.
#[derive(Debug, Clone)]
pub struct OwnerIdPolicy {
    pattern: Option<Regex>,
    placeholders: Vec<String>,
}

impl OwnerIdPolicy {
    pub fn from_config(config: &OwnerIdConfig) -> Result<Self, ReconError> {
        let pattern = match config.pattern {
            Some(ref p) => Some(
                Regex::new(p).map_err(|e| ReconError::ConfigValidation(format!("owner_ids.pattern: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            pattern,
            placeholders: config.placeholders.iter().map(|p| p.to_lowercase()).collect(),
        })
    }

    /// Returns the reason an identifier is malformed, if it is.
    pub fn check(&self, id: &str) -> Result<(), String> {
        if id.is_empty() {
            return Err("empty owner identifier".into());
        }
        if id.trim() != id {
            return Err(format!("owner identifier {id:?} has surrounding whitespace"));
        }
        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(format!("owner identifier {id:?} contains whitespace or control characters"));
        }
        if self.placeholders.contains(&id.to_lowercase()) {
            return Err(format!("owner identifier {id:?} is a placeholder"));
        }
        if let Some(ref re) = self.pattern {
            if !re.is_match(id) {
                return Err(format!("owner identifier {id:?} does not match {}", re.as_str()));
            }
        }
        Ok(())
    }
}

impl Default for OwnerIdPolicy {
    fn default() -> Self {
        // Default config carries no pattern, so this cannot fail.
        Self {
            pattern: None,
            placeholders: OwnerIdConfig::default().placeholders,
        }
    }
}
