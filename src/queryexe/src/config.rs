use common::DbError;
use std::fs;
use std::path::Path;

/// Tuning knobs of the query engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Rows per block requested from drivers.
    pub max_block_size: usize,
    /// Number of values per partition of an oversized integer `in` list.
    pub in_part_size: usize,
    /// Whether a LIMIT may be pushed down to a driver that supports it.
    pub limit_in_driver: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_block_size: 64,
            in_part_size: 1023,
            limit_in_driver: true,
        }
    }
}

impl EngineConfig {
    /// Parse a config from JSON. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| DbError::ValidationError(format!("bad engine config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, DbError> {
        info!("loading engine config from {:?}", path);
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn check(&self) -> Result<(), DbError> {
        if self.max_block_size == 0 {
            return Err(DbError::ValidationError(String::from(
                "max_block_size must be positive",
            )));
        }
        if self.in_part_size == 0 {
            return Err(DbError::ValidationError(String::from(
                "in_part_size must be positive",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_testdir::TempDir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.in_part_size, 1023);
    }

    #[test]
    fn test_partial_and_invalid() {
        let config = EngineConfig::from_json(r#"{"max_block_size": 8}"#).unwrap();
        assert_eq!(config.max_block_size, 8);
        assert!(config.limit_in_driver);
        assert!(EngineConfig::from_json(r#"{"in_part_size": 0}"#).is_err());
        assert!(EngineConfig::from_json("[").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = TempDir::default();
        let mut path = dir.to_path_buf();
        path.push("engine.json");
        fs::write(&path, r#"{"limit_in_driver": false}"#).unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert!(!config.limit_in_driver);
        assert_eq!(config.max_block_size, 64);
    }
}
