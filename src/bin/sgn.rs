//! sgn - encode a payload file with a polymorphic decoder stub.

use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::{debug, info};
use sgn_engine::emulator;
use sgn_engine::pipeline::{PipelineConfig, PipelineDefinition, StageConfig, StageKind, StageOptions};
use sgn_engine::{Architecture, Pipeline};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Arch {
    X64,
    X32,
    Aarch64,
}

impl From<Arch> for Architecture {
    fn from(arch: Arch) -> Self {
        match arch {
            Arch::X64 => Architecture::X64,
            Arch::X32 => Architecture::X32,
            Arch::Aarch64 => Architecture::AArch64,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EncoderKind {
    Sgn,
    XorDynamic,
    Schema,
}

impl From<EncoderKind> for StageKind {
    fn from(kind: EncoderKind) -> Self {
        match kind {
            EncoderKind::Sgn => StageKind::Sgn,
            EncoderKind::XorDynamic => StageKind::XorDynamic,
            EncoderKind::Schema => StageKind::Schema,
        }
    }
}

/// Polymorphic shikata-ga-nai style payload encoder
#[derive(Parser, Debug)]
#[command(name = "sgn")]
#[command(about = "Polymorphic payload encoder with decoder stub synthesis", long_about = None)]
struct Cli {
    /// Payload to encode
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,
    /// Where to write decoder + encoded payload
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
    /// YAML pipeline definition; replaces the single-encoder options
    #[arg(
        short,
        long,
        value_name = "FILE",
        conflicts_with_all = ["encoder", "arch", "seed", "plain_decoder", "encoding_count", "save_registers"]
    )]
    pipeline: Option<PathBuf>,
    /// Encoder to run
    #[arg(short, long, value_enum, default_value = "sgn")]
    encoder: EncoderKind,
    /// Target architecture of the decoder stub
    #[arg(short, long, value_enum, default_value = "x64")]
    arch: Arch,
    /// Encoder seed; random when omitted
    #[arg(short, long)]
    seed: Option<u8>,
    /// Minimal stub without junk or register randomization
    #[arg(long)]
    plain_decoder: bool,
    /// Number of encoding passes (sgn only)
    #[arg(short = 'c', long)]
    encoding_count: Option<u32>,
    /// Preserve every register (and flags) the stub touches (sgn only)
    #[arg(long)]
    save_registers: bool,
    /// Run the decoders in the emulator and check the decoded payload
    #[arg(long)]
    verify: bool,
    /// Write a hex dump instead of raw bytes
    #[arg(long)]
    hex: bool,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

impl Cli {
    /// One-stage definition from the single-encoder options.
    fn single_stage(&self) -> PipelineConfig {
        PipelineConfig {
            pipeline: PipelineDefinition {
                name: "sgn".to_string(),
                description: String::new(),
                stages: vec![StageConfig {
                    kind: StageKind::from(self.encoder),
                    config: StageOptions {
                        architecture: Architecture::from(self.arch),
                        seed: self.seed,
                        plain_decoder: self.plain_decoder.then_some(true),
                        encoding_count: self.encoding_count,
                        save_registers: self.save_registers.then_some(true),
                    },
                }],
            },
        }
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 3);
    for line in bytes.chunks(16) {
        text.push_str(&line.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" "));
        text.push('\n');
    }
    text
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    env_logger::builder().filter_level(cli.log_level).init();

    let config = match &cli.pipeline {
        Some(path) => PipelineConfig::from_file(path)?,
        None => cli.single_stage(),
    };
    let pipeline = Pipeline::from_config(&config)?;
    debug!("{pipeline:?}");

    let payload = fs::read(&cli.input)?;
    let layers = pipeline.run_traced(&payload)?;
    for (index, layer) in layers.iter().enumerate() {
        info!(
            "stage {index} ({} {}): {}-byte decoder, {} encoded bytes, {} bytes total",
            layer.stage,
            layer.architecture,
            layer.buffer.stub_len(),
            layer.buffer.encoded_payload().len(),
            layer.buffer.len()
        );
    }

    if cli.verify {
        let outcomes = emulator::verify_layers(&layers, &payload)?;
        for (depth, outcome) in outcomes.iter().enumerate() {
            info!(
                "layer {depth} verified in {} steps (registers preserved: {})",
                outcome.steps, outcome.registers_preserved
            );
            if !outcome.icache_coherent {
                return Err(format!("layer {depth} left decoded bytes stale for instruction fetch").into());
            }
        }
        if cli.pipeline.is_none() && cli.save_registers && !outcomes.iter().all(|outcome| outcome.registers_preserved) {
            return Err("stub did not restore the register file".into());
        }
    }

    let Some(outermost) = layers.into_iter().last() else {
        return Err("pipeline produced no output".into());
    };
    if cli.hex {
        fs::write(&cli.output, hex_dump(outermost.buffer.as_bytes()))?;
    } else {
        fs::write(&cli.output, outermost.buffer.into_vec())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_lines() {
        let bytes: Vec<u8> = (0..18).collect();
        assert_eq!(
            hex_dump(&bytes),
            "00 01 02 03 04 05 06 07 08 09 0a 0b 0c 0d 0e 0f\n10 11\n"
        );
        assert!(hex_dump(&[]).is_empty());
    }

    #[test]
    fn test_pipeline_conflicts_with_encoder_options() {
        let parsed = Cli::try_parse_from(["sgn", "-i", "a", "-o", "b", "--pipeline", "p.yaml", "--seed", "1"]);
        assert!(parsed.is_err());
        let cli = Cli::try_parse_from(["sgn", "-i", "a", "-o", "b", "--encoder", "xor-dynamic", "-a", "aarch64"]).unwrap();
        let config = cli.single_stage();
        assert_eq!(config.pipeline.stages[0].kind, StageKind::XorDynamic);
        assert_eq!(config.pipeline.stages[0].config.encoding_count, None);
        config.validate().unwrap();
    }
}
