// Pipeline definitions as read from YAML. A file holds one `pipeline` mapping with a name, an
// optional description and an ordered list of stages; each stage names its encoder under
// `type` and carries its options under `config`. Unknown keys are rejected at parse time.
// Options that only make sense for some encoders are optional here and checked when the stage
// is built, so a schema stage with `encoding_count` is an error rather than silently ignored.
// A stage without a seed gets a random one, logged so the run can be reproduced.

//! YAML pipeline configuration.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use super::Stage;
use crate::core::config::Architecture;
use crate::core::error::{ConfigurationError, PipelineError};
use crate::encoder::Encoder;
use crate::schema::SchemaEncoder;
use crate::xor_dynamic::XorDynamicEncoder;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub pipeline: PipelineDefinition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub stages: Vec<StageConfig>,
}

/// Encoder a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Sgn,
    XorDynamic,
    Schema,
}

impl StageKind {
    pub const fn name(self) -> &'static str {
        match self {
            StageKind::Sgn => Encoder::NAME,
            StageKind::XorDynamic => XorDynamicEncoder::NAME,
            StageKind::Schema => SchemaEncoder::NAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    #[serde(rename = "type")]
    pub kind: StageKind,
    pub config: StageOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOptions {
    pub architecture: Architecture,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_decoder: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_registers: Option<bool>,
}

impl PipelineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, PipelineError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn to_yaml(&self) -> Result<String, PipelineError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check the definition and every stage's options without running anything.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.pipeline.name.trim().is_empty() {
            return Err(PipelineError::EmptyName);
        }
        if self.pipeline.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        for (index, stage) in self.pipeline.stages.iter().enumerate() {
            stage
                .check_options()
                .map_err(|source| PipelineError::Configuration { index, source })?;
        }
        Ok(())
    }
}

impl StageConfig {
    fn reject(&self, option: &'static str, present: bool) -> Result<(), ConfigurationError> {
        if present {
            return Err(ConfigurationError::UnsupportedStageOption {
                stage: self.kind.name(),
                option,
            });
        }
        Ok(())
    }

    fn check_options(&self) -> Result<(), ConfigurationError> {
        let options = &self.config;
        match self.kind {
            StageKind::Sgn => {
                if options.encoding_count == Some(0) {
                    return Err(ConfigurationError::ZeroEncodingCount);
                }
                Ok(())
            }
            StageKind::XorDynamic => {
                self.reject("plain_decoder", options.plain_decoder.is_some())?;
                self.reject("encoding_count", options.encoding_count.is_some())?;
                self.reject("save_registers", options.save_registers.is_some())
            }
            StageKind::Schema => {
                self.reject("encoding_count", options.encoding_count.is_some())?;
                self.reject("save_registers", options.save_registers.is_some())?;
                if options.architecture == Architecture::AArch64 {
                    return Err(ConfigurationError::UnsupportedEncoderArchitecture {
                        encoder: SchemaEncoder::NAME,
                        architecture: options.architecture,
                    });
                }
                Ok(())
            }
        }
    }

    fn seed(&self, index: usize) -> u8 {
        self.config.seed.unwrap_or_else(|| {
            let seed = rand::random::<u8>();
            info!("stage {index} ({}) has no seed, using {seed:#04x}", self.kind.name());
            seed
        })
    }

    /// Build the encoder this stage describes.
    pub fn build(&self, index: usize) -> Result<Box<dyn Stage>, ConfigurationError> {
        self.check_options()?;
        let options = &self.config;
        let seed = self.seed(index);
        let stage: Box<dyn Stage> = match self.kind {
            StageKind::Sgn => Box::new(Encoder::new(
                options.architecture,
                seed,
                options.plain_decoder.unwrap_or(false),
                options.encoding_count.unwrap_or(1),
                options.save_registers.unwrap_or(false),
            )?),
            StageKind::XorDynamic => Box::new(XorDynamicEncoder::new(options.architecture, seed)),
            StageKind::Schema => Box::new(SchemaEncoder::new(
                options.architecture,
                seed,
                options.plain_decoder.unwrap_or(false),
            )?),
        };
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_STAGES: &str = r#"
pipeline:
  name: layered
  description: sgn under xor_dynamic
  stages:
    - type: sgn
      config:
        architecture: x64
        seed: 66
        encoding_count: 2
    - type: xor_dynamic
      config:
        architecture: amd64
        seed: 7
"#;

    #[test]
    fn test_parse_stages() {
        let config = PipelineConfig::from_yaml(TWO_STAGES).unwrap();
        assert_eq!(config.pipeline.name, "layered");
        assert_eq!(config.pipeline.stages.len(), 2);
        let first = &config.pipeline.stages[0];
        assert_eq!(first.kind, StageKind::Sgn);
        assert_eq!(first.config.seed, Some(66));
        assert_eq!(first.config.encoding_count, Some(2));
        assert_eq!(first.config.plain_decoder, None);
        assert_eq!(config.pipeline.stages[1].config.architecture, Architecture::X64);
        config.validate().unwrap();
    }

    #[test]
    fn test_description_is_optional() {
        let yaml = "pipeline:\n  name: p\n  stages:\n    - type: schema\n      config: { architecture: x32 }\n";
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        assert!(config.pipeline.description.is_empty());
        assert_eq!(config.pipeline.stages[0].config.seed, None);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "pipeline:\n  name: p\n  stages:\n    - type: sgn\n      config: { architecture: x64, badchars: [0] }\n";
        assert!(matches!(PipelineConfig::from_yaml(yaml), Err(PipelineError::Parse(_))));
        let yaml = "pipeline:\n  name: p\n  stages:\n    - type: rot13\n      config: { architecture: x64 }\n";
        assert!(matches!(PipelineConfig::from_yaml(yaml), Err(PipelineError::Parse(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PipelineConfig::from_yaml(TWO_STAGES).unwrap();
        config.pipeline.stages[1].config.save_registers = Some(true);
        match config.validate() {
            Err(PipelineError::Configuration { index, source }) => {
                assert_eq!(index, 1);
                assert_eq!(
                    source,
                    ConfigurationError::UnsupportedStageOption {
                        stage: "xor_dynamic",
                        option: "save_registers",
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        config.pipeline.stages.clear();
        assert!(matches!(config.validate(), Err(PipelineError::NoStages)));
        config.pipeline.name = "  ".into();
        assert!(matches!(config.validate(), Err(PipelineError::EmptyName)));
    }

    #[test]
    fn test_schema_stage_needs_x86() {
        let stage = StageConfig {
            kind: StageKind::Schema,
            config: StageOptions {
                architecture: Architecture::AArch64,
                seed: Some(1),
                plain_decoder: None,
                encoding_count: None,
                save_registers: None,
            },
        };
        assert!(matches!(
            stage.build(0),
            Err(ConfigurationError::UnsupportedEncoderArchitecture { encoder: "schema", .. })
        ));
    }

    #[test]
    fn test_yaml_round_trip_keeps_definition() {
        let config = PipelineConfig::from_yaml(TWO_STAGES).unwrap();
        let again = PipelineConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = PipelineConfig::from_file("/nonexistent/pipeline.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pipeline.yaml"));
    }
}
