use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::errors::Result;
use crate::report::OutputTarget;

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    Cpu,
    Gpu,
}

// `-h` belongs to --image-height, so the automatic help flag is replaced by a
// long-only one.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, disable_help_flag = true)]
pub struct Config {
    /// Multiplier applied to pixel values in [0, 1] before inference
    #[arg(short, long, value_parser = parse_scale)]
    pub scale: f32,

    /// Width every image is resized to
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub image_width: u32,

    /// Height every image is resized to
    #[arg(short = 'h', long, value_parser = clap::value_parser!(u32).range(1..))]
    pub image_height: u32,

    /// Load images as RGB instead of grayscale
    #[arg(short, long)]
    pub color: bool,

    /// Run inference on the GPU
    #[arg(short, long)]
    pub gpu: bool,

    /// Model architecture (ONNX graph)
    #[arg(short, long, default_value = "classifier.onnx")]
    pub model: PathBuf,

    /// External weights file referenced by the model. It is not passed to the
    /// runtime: it must sit next to the model under the file name recorded in
    /// the graph's external-data entries
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Classify the center crop only instead of averaging ten crops
    #[arg(long)]
    pub no_oversample: bool,

    #[arg(short, long, default_value = "images")]
    pub images_dir: PathBuf,

    #[arg(short, long, default_value = "result.json")]
    pub output: PathBuf,

    /// Print the result to standard output instead of writing a file
    #[arg(long)]
    pub stdout: bool,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long)]
    pub verbose: bool,

    #[allow(dead_code)]
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,
}

impl Config {
    /// Resolves a configuration from an argument list (program name first).
    ///
    /// Either every required option is present and valid, or the call fails
    /// with [`ClassifyError::Configuration`](crate::ClassifyError::Configuration).
    pub fn resolve_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Ok(Self::try_parse_from(args)?)
    }

    pub const fn compute_mode(&self) -> ComputeMode {
        if self.gpu {
            ComputeMode::Gpu
        } else {
            ComputeMode::Cpu
        }
    }

    pub const fn oversample(&self) -> bool {
        !self.no_oversample
    }

    pub const fn channels(&self) -> usize {
        if self.color {
            3
        } else {
            1
        }
    }

    pub fn output_target(&self) -> OutputTarget {
        if self.stdout {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(self.output.clone())
        }
    }
}

fn parse_scale(s: &str) -> std::result::Result<f32, String> {
    let scale: f32 = s
        .parse()
        .map_err(|_| format!("`{}` is not a number", s))?;
    if !scale.is_finite() || scale <= 0.0 {
        return Err(format!("scale must be a positive number, got {}", s));
    }
    Ok(scale)
}
