//! Compiler configuration
//!
//! Loaded from TOML by tools; every field has a default so an empty file is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use target_lexicon::Triple;
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Target triple not understood
    #[error("Unknown target triple: {0}")]
    UnknownTriple(String),

    /// Pointer width other than 32 or 64
    #[error("Unsupported pointer width: {0}")]
    UnsupportedPointerWidth(u32),
}

/// Encoding of `System.Char` and string literals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharEncoding {
    #[default]
    Utf16,
    Utf8,
}

impl CharEncoding {
    /// Width of one code unit in bits
    pub fn unit_bits(self) -> u32 {
        match self {
            CharEncoding::Utf16 => 16,
            CharEncoding::Utf8 => 8,
        }
    }
}

/// How the class-initialized flag is claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassInitPolicy {
    /// Plain check-then-set (single-threaded targets)
    #[default]
    Relaxed,
    /// Compare-and-swap on the flag; only the winner runs the initializer
    Atomic,
}

/// Configuration for the compiler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CompilerConfig {
    /// Target triple; when set it decides the pointer width
    pub target_triple: Option<String>,
    /// Pointer width in bits (default: 64)
    pub pointer_width: u32,
    /// Char encoding (default: UTF-16)
    pub char_encoding: CharEncoding,
    /// Skip module metadata and runtime registration (default: false)
    pub test_mode: bool,
    /// Declare symbols of other modules with weak linkage (default: false)
    pub weak_externals: bool,
    /// Class initializer guard (default: relaxed)
    pub class_init: ClassInitPolicy,
    /// Emit a `main` calling the assembly entry point (default: true)
    pub emit_main: bool,
    /// Pass small value types through integer carriers (default: true)
    pub abi_coercion: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target_triple: None,
            pointer_width: 64,
            char_encoding: CharEncoding::Utf16,
            test_mode: false,
            weak_externals: false,
            class_init: ClassInitPolicy::Relaxed,
            emit_main: true,
            abi_coercion: true,
        }
    }
}

impl CompilerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Effective pointer width, taking the target triple into account
    pub fn resolved_pointer_width(&self) -> Result<u32, ConfigError> {
        let bits = match &self.target_triple {
            Some(triple) => {
                let parsed = Triple::from_str(triple).map_err(|_| ConfigError::UnknownTriple(triple.clone()))?;
                let width = parsed.pointer_width().map_err(|_| ConfigError::UnknownTriple(triple.clone()))?;
                width.bits() as u32
            }
            None => self.pointer_width,
        };
        match bits {
            32 | 64 => Ok(bits),
            other => Err(ConfigError::UnsupportedPointerWidth(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = CompilerConfig::from_toml_str("").unwrap();
        assert_eq!(config, CompilerConfig::default());
    }

    #[test]
    fn test_parse_fields() {
        let config = CompilerConfig::from_toml_str(
            r#"
            pointer-width = 32
            char-encoding = "utf8"
            class-init = "atomic"
            weak-externals = true
            "#,
        )
        .unwrap();
        assert_eq!(config.pointer_width, 32);
        assert_eq!(config.char_encoding, CharEncoding::Utf8);
        assert_eq!(config.class_init, ClassInitPolicy::Atomic);
        assert!(config.weak_externals);
        assert!(config.emit_main);
    }

    #[test]
    fn test_triple_decides_pointer_width() {
        let config = CompilerConfig {
            target_triple: Some("i686-unknown-linux-gnu".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolved_pointer_width().unwrap(), 32);

        let bad = CompilerConfig { pointer_width: 16, ..Default::default() };
        assert!(matches!(bad.resolved_pointer_width(), Err(ConfigError::UnsupportedPointerWidth(16))));
    }
}
