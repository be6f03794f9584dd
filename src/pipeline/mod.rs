// Multi-stage encoding. A Pipeline is an ordered list of stages; each stage is one of the
// encoders behind the Stage trait and consumes the complete output of the stage before it,
// so the last stage's decoder runs first and every decoder falls through into the output of
// the stage below it. Pipelines are built in code with with_stage or loaded from a YAML
// definition (see config). run returns the final buffer; run_traced also keeps every
// intermediate buffer so each layer can be inspected or emulated on its own.

//! Chained encoders.

pub mod config;

use std::path::Path;

use log::debug;

use crate::core::buffer::OutputBuffer;
use crate::core::config::Architecture;
use crate::core::error::{PipelineError, SgnResult};
use crate::encoder::Encoder;
use crate::schema::SchemaEncoder;
use crate::xor_dynamic::XorDynamicEncoder;

pub use self::config::{PipelineConfig, PipelineDefinition, StageConfig, StageKind, StageOptions};

/// One encoding layer.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Architecture of the decoder this stage emits.
    fn architecture(&self) -> Architecture;

    /// Encode `input` into decoder plus encoded bytes.
    fn process(&self, input: &[u8]) -> SgnResult<OutputBuffer>;
}

impl Stage for Encoder {
    fn name(&self) -> &'static str {
        Encoder::NAME
    }

    fn architecture(&self) -> Architecture {
        self.config().architecture
    }

    fn process(&self, input: &[u8]) -> SgnResult<OutputBuffer> {
        self.encode(input)
    }
}

impl Stage for XorDynamicEncoder {
    fn name(&self) -> &'static str {
        XorDynamicEncoder::NAME
    }

    fn architecture(&self) -> Architecture {
        XorDynamicEncoder::architecture(self)
    }

    fn process(&self, input: &[u8]) -> SgnResult<OutputBuffer> {
        self.encode(input)
    }
}

impl Stage for SchemaEncoder {
    fn name(&self) -> &'static str {
        SchemaEncoder::NAME
    }

    fn architecture(&self) -> Architecture {
        SchemaEncoder::architecture(self)
    }

    fn process(&self, input: &[u8]) -> SgnResult<OutputBuffer> {
        self.encode(input)
    }
}

/// Output of one stage during a traced run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    pub stage: &'static str,
    pub architecture: Architecture,
    pub buffer: OutputBuffer,
}

/// Ordered encoding stages.
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, PipelineError> {
        Self::from_config(&PipelineConfig::from_yaml(yaml)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        Self::from_config(&PipelineConfig::from_file(path)?)
    }

    /// Validate `config` and build its stages.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let mut pipeline = Self::new(config.pipeline.name.clone());
        for (index, stage) in config.pipeline.stages.iter().enumerate() {
            let stage = stage
                .build(index)
                .map_err(|source| PipelineError::Configuration { index, source })?;
            pipeline.stages.push(stage);
        }
        Ok(pipeline)
    }

    /// Append a stage; it runs after every stage added before it.
    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage names in run order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage and return the last one's output.
    pub fn run(&self, input: &[u8]) -> Result<OutputBuffer, PipelineError> {
        let mut outputs = self.run_traced(input)?;
        outputs.pop().map(|output| output.buffer).ok_or(PipelineError::NoStages)
    }

    /// Run every stage, keeping each stage's output in run order.
    pub fn run_traced(&self, input: &[u8]) -> Result<Vec<StageOutput>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }

        let mut outputs: Vec<StageOutput> = Vec::with_capacity(self.stages.len());
        for (index, stage) in self.stages.iter().enumerate() {
            let data = outputs.last().map_or(input, |output| output.buffer.as_bytes());
            let buffer = stage.process(data).map_err(|source| PipelineError::Stage {
                index,
                stage: stage.name(),
                source,
            })?;
            debug!(
                "pipeline {}: stage {index} ({} {}) {} -> {} bytes",
                self.name,
                stage.name(),
                stage.architecture(),
                data.len(),
                buffer.len()
            );
            outputs.push(StageOutput {
                stage: stage.name(),
                architecture: stage.architecture(),
                buffer,
            });
        }
        Ok(outputs)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stage_names())
            .finish()
    }
}
