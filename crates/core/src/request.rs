use std::ops::RangeInclusive;
use std::path::PathBuf;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

pub const DEFAULT_PROMPT: &str = "a person is speaking with gestures and emotions";
pub const DEFAULT_NEGATIVE_PROMPT: &str =
    "bright tones, overexposed, static, blurred details, worst quality, low quality";
pub const DEFAULT_NUM_FRAMES: i64 = 100;
pub const DEFAULT_FPS: i64 = 25;
pub const DEFAULT_STEPS: i64 = 6;
pub const DEFAULT_CFG_SCALE: f64 = 1.0;
pub const RANDOM_SEED: i64 = -1;

const NUM_FRAMES_RANGE: RangeInclusive<i64> = 1..=1000;
const FPS_RANGE: RangeInclusive<i64> = 10..=60;
const STEPS_RANGE: RangeInclusive<i64> = 1..=50;
const CFG_SCALE_RANGE: RangeInclusive<f64> = 0.1..=20.0;

/// Upper bound (inclusive) of a randomly drawn seed.
pub const MAX_RANDOM_SEED: u64 = u32::MAX as u64;

/// User-supplied prediction inputs, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub input_image: PathBuf,
    #[serde(default)]
    pub audio_file: Option<PathBuf>,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_num_frames")]
    pub num_frames: i64,
    #[serde(default = "default_fps")]
    pub fps: i64,
    #[serde(default = "default_steps")]
    pub steps: i64,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f64,
    #[serde(default = "default_seed")]
    pub seed: i64,
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_negative_prompt() -> String {
    DEFAULT_NEGATIVE_PROMPT.to_string()
}

fn default_num_frames() -> i64 {
    DEFAULT_NUM_FRAMES
}

fn default_fps() -> i64 {
    DEFAULT_FPS
}

fn default_steps() -> i64 {
    DEFAULT_STEPS
}

fn default_cfg_scale() -> f64 {
    DEFAULT_CFG_SCALE
}

fn default_seed() -> i64 {
    RANDOM_SEED
}

/// A request whose fields are inside their domains and whose seed is concrete.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub input_image: PathBuf,
    pub audio_file: Option<PathBuf>,
    pub prompt: String,
    pub negative_prompt: String,
    pub num_frames: u32,
    pub fps: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub seed: u64,
}

impl PredictionRequest {
    pub fn new(input_image: impl Into<PathBuf>) -> Self {
        Self {
            input_image: input_image.into(),
            audio_file: None,
            prompt: default_prompt(),
            negative_prompt: default_negative_prompt(),
            num_frames: DEFAULT_NUM_FRAMES,
            fps: DEFAULT_FPS,
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            seed: RANDOM_SEED,
        }
    }

    pub fn validate(self) -> Result<ValidatedRequest, RequestError> {
        self.validate_with_rng(&mut rand::thread_rng())
    }

    pub fn validate_with_rng<R: Rng>(
        self,
        rng: &mut R,
    ) -> Result<ValidatedRequest, RequestError> {
        let num_frames = check_int("num_frames", self.num_frames, NUM_FRAMES_RANGE)?;
        let fps = check_int("fps", self.fps, FPS_RANGE)?;
        let steps = check_int("steps", self.steps, STEPS_RANGE)?;

        if !CFG_SCALE_RANGE.contains(&self.cfg_scale) {
            return Err(RequestError::OutOfRange {
                field: "cfg_scale",
                value: self.cfg_scale.to_string(),
                min: CFG_SCALE_RANGE.start().to_string(),
                max: CFG_SCALE_RANGE.end().to_string(),
            });
        }

        let seed = resolve_seed(self.seed, rng)?;

        if !self.input_image.is_file() {
            return Err(RequestError::MissingFile {
                field: "input_image",
                path: self.input_image,
            });
        }
        if let Some(audio) = &self.audio_file {
            if !audio.is_file() {
                return Err(RequestError::MissingFile {
                    field: "audio_file",
                    path: audio.clone(),
                });
            }
        }

        Ok(ValidatedRequest {
            input_image: self.input_image,
            audio_file: self.audio_file,
            prompt: self.prompt,
            negative_prompt: self.negative_prompt,
            num_frames,
            fps,
            steps,
            cfg_scale: self.cfg_scale,
            seed,
        })
    }
}

/// `-1` draws uniformly from `0..=MAX_RANDOM_SEED`; any other non-negative
/// seed is used as is.
pub fn resolve_seed<R: Rng>(seed: i64, rng: &mut R) -> Result<u64, RequestError> {
    match seed {
        RANDOM_SEED => Ok(rng.gen_range(0..=MAX_RANDOM_SEED)),
        s if s >= 0 => Ok(s as u64),
        s => Err(RequestError::InvalidSeed(s)),
    }
}

fn check_int(
    field: &'static str,
    value: i64,
    range: RangeInclusive<i64>,
) -> Result<u32, RequestError> {
    if range.contains(&value) {
        // Every configured range fits in u32.
        Ok(value as u32)
    } else {
        Err(RequestError::OutOfRange {
            field,
            value: value.to_string(),
            min: range.start().to_string(),
            max: range.end().to_string(),
        })
    }
}
