/*!
Configuration management for the register tree driver.
*/

use anyhow::{anyhow, Context, Result};
use regtree::{EmulatorConfig, Endianness, Mode, Model, ModelKind, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub root: RootConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    /// Create a new configuration with a small example tree
    pub fn new() -> Self {
        Self {
            root: RootConfig::default(),
            emulator: EmulatorConfig::default(),
            devices: vec![DeviceConfig {
                name: "ctrl".to_string(),
                offset: 0x1000,
                enable: true,
                variables: vec![
                    VariableConfig::new("mode", 0x0, "UInt", 4)
                        .with_value("Run")
                        .with_enum("0", "Off")
                        .with_enum("1", "Run"),
                    VariableConfig {
                        bit_offset: 4,
                        ..VariableConfig::new("gain", 0x0, "Int", 12).with_value("-3")
                    },
                    VariableConfig {
                        bit_offset: 16,
                        mode: Mode::RO,
                        poll: true,
                        ..VariableConfig::new("status", 0x0, "UInt", 16)
                    },
                    VariableConfig::new("scale", 0x4, "Float", 32).with_value("1.5"),
                ],
                memory: vec![MemoryConfig {
                    name: "table".to_string(),
                    offset: 0x100,
                    size: 0x100,
                    word_bit_size: 32,
                    stride: 4,
                    verify: true,
                    values: BTreeMap::from([("0x0".to_string(), "1, 2, 3, 4".to_string())]),
                }],
            }],
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Root node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// Name of the root node, first component of every path
    pub name: String,

    /// Default monitor poll interval in milliseconds
    pub poll_period_ms: u64,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            name: "root".to_string(),
            poll_period_ms: 1000,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mode() -> Mode {
    Mode::RW
}

fn default_word_bits() -> usize {
    32
}

fn default_stride() -> usize {
    4
}

/// Top-level device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    /// Base address in the emulated memory space
    pub offset: u64,

    #[serde(default = "default_true")]
    pub enable: bool,

    #[serde(default)]
    pub variables: Vec<VariableConfig>,

    /// Bulk memory windows placed under this device
    #[serde(default)]
    pub memory: Vec<MemoryConfig>,
}

/// Register field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,

    /// Byte offset of the backing block within the device
    pub offset: u64,

    #[serde(default)]
    pub bit_offset: usize,

    /// Model kind: UInt, UIntReversed, Int, Bool, String, Float, Double or Fixed
    pub model: String,

    pub bit_size: usize,

    #[serde(default)]
    pub bin_point: u32,

    #[serde(default)]
    pub big_endian: bool,

    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default)]
    pub poll: bool,

    /// Display text written when the tree is applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Raw literal to display label
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enums: BTreeMap<String, String>,
}

impl VariableConfig {
    pub fn new(name: &str, offset: u64, model: &str, bit_size: usize) -> Self {
        Self {
            name: name.to_string(),
            offset,
            bit_offset: 0,
            model: model.to_string(),
            bit_size,
            bin_point: 0,
            big_endian: false,
            mode: Mode::RW,
            poll: false,
            value: None,
            enums: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_enum(mut self, raw: &str, label: &str) -> Self {
        self.enums.insert(raw.to_string(), label.to_string());
        self
    }

    /// Resolve the configured codec
    pub fn model(&self) -> Result<Arc<Model>> {
        let kind = ModelKind::from_str(&self.model)
            .ok_or_else(|| anyhow!("Unknown model '{}' for {}", self.model, self.name))?;
        let bit_size = kind.fixed_bit_size().unwrap_or(self.bit_size);
        let endianness = if self.big_endian {
            Endianness::Big
        } else {
            Endianness::Little
        };

        Model::new(kind, bit_size, self.bin_point, endianness)
            .with_context(|| format!("Invalid model for {}", self.name))
    }

    /// Enum entries parsed through the variable's model
    pub fn enum_entries(&self, model: &Model) -> Result<Vec<(Value, String)>> {
        self.enums
            .iter()
            .map(|(raw, label)| {
                model
                    .from_string(raw)
                    .map(|v| (v, label.clone()))
                    .with_context(|| format!("Invalid enum key '{}' for {}", raw, self.name))
            })
            .collect()
    }
}

/// Bulk memory window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub name: String,

    /// Offset from the parent device
    pub offset: u64,

    /// Window size in bytes
    pub size: u64,

    #[serde(default = "default_word_bits")]
    pub word_bit_size: usize,

    #[serde(default = "default_stride")]
    pub stride: usize,

    #[serde(default = "default_true")]
    pub verify: bool,

    /// Offset literal to comma-separated values staged on apply
    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

impl MemoryConfig {
    /// Staged entries with offsets parsed as integer literals
    pub fn staged(&self) -> Result<BTreeMap<u64, String>> {
        let parser = Model::uint(64)?;
        self.values
            .iter()
            .map(|(offset, values)| {
                let offset = parser
                    .from_string(offset)
                    .ok()
                    .and_then(|v| v.as_u128())
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or_else(|| anyhow!("Invalid offset '{}' in {}", offset, self.name))?;
                Ok((offset, values.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let original_config = AppConfig::new();

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(format!("{:?}", original_config), format!("{:?}", loaded_config));
    }

    #[test]
    fn test_default_values() {
        let config = AppConfig::new();

        assert_eq!(config.root.name, "root");
        assert_eq!(config.root.poll_period_ms, 1000);
        assert_eq!(config.emulator.min_access, 4);
        assert!(!config.emulator.threaded);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].variables.len(), 4);
        assert_eq!(config.devices[0].memory[0].stride, 4);
    }

    #[test]
    fn test_minimal_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [root]
            name = "lab"
            poll_period_ms = 250

            [[devices]]
            name = "adc"
            offset = 0x2000

            [[devices.variables]]
            name = "threshold"
            offset = 0x10
            model = "int"
            bit_size = 14
            mode = "RW"
            "#,
        )
        .unwrap();

        let device = &config.devices[0];
        assert!(device.enable);
        assert_eq!(device.offset, 0x2000);
        assert_eq!(config.emulator.max_access, 4096);

        let model = device.variables[0].model().unwrap();
        assert_eq!(model.name(), "Int14");
    }

    #[test]
    fn test_model_resolution() {
        let double = VariableConfig::new("d", 0, "Double", 0);
        assert_eq!(double.model().unwrap().bit_size(), 64);

        let bad = VariableConfig::new("x", 0, "Complex", 8);
        assert!(bad.model().is_err());

        let be = VariableConfig {
            big_endian: true,
            ..VariableConfig::new("b", 0, "UInt", 16)
        };
        assert_eq!(be.model().unwrap().name(), "UIntBE16");
    }

    #[test]
    fn test_memory_offsets() {
        let memory = &AppConfig::new().devices[0].memory[0];
        let staged = memory.staged().unwrap();
        assert_eq!(staged.get(&0), Some(&"1, 2, 3, 4".to_string()));

        let mut bad = memory.clone();
        bad.values.insert("-4".to_string(), "1".to_string());
        assert!(bad.staged().is_err());
    }
}
