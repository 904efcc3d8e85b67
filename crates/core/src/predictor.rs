use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ResolvedPaths};
use crate::engine::{ComfyHttpEngine, ExecutionEngine};
use crate::error::PredictError;
use crate::output::{clear_output_dir, locate_latest_video, select_reported_video};
use crate::request::PredictionRequest;
use crate::staging::InputStager;
use crate::workflow::{BindingTable, Parameter, PatchValues, WorkflowTemplate};

/// A finished prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub output: PathBuf,
    pub seed: u64,
    pub elapsed: Duration,
}

/// Runs requests against the external engine one at a time. The input and
/// output directories are shared state, so the whole pipeline runs under a
/// single lock.
pub struct Predictor {
    paths: ResolvedPaths,
    bindings: BindingTable,
    settle_delay: Duration,
    engine: Box<dyn ExecutionEngine>,
    lock: Mutex<()>,
}

impl Predictor {
    pub fn new(
        paths: ResolvedPaths,
        bindings: BindingTable,
        settle_delay: Duration,
        engine: Box<dyn ExecutionEngine>,
    ) -> Self {
        Self {
            paths,
            bindings,
            settle_delay,
            engine,
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let bindings = BindingTable::with_overrides(&config.bindings)
            .context("invalid [bindings] section in config")?;
        let engine = ComfyHttpEngine::from_config(&config.engine)?;
        Ok(Self::new(
            config.paths.resolve(),
            bindings,
            config.engine.settle_delay(),
            Box::new(engine),
        ))
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn predict(&self, request: PredictionRequest) -> Result<Prediction, PredictError> {
        self.predict_with_id(Uuid::new_v4().to_string(), request)
    }

    pub fn predict_with_id(
        &self,
        prediction_id: String,
        request: PredictionRequest,
    ) -> Result<Prediction, PredictError> {
        let span = info_span!("predict", prediction_id = %prediction_id);
        let _entered = span.enter();

        let request = request.validate()?;
        let seed = request.seed;

        let wait_started = Instant::now();
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let queued = wait_started.elapsed();
        if queued > Duration::from_millis(100) {
            debug!(queued_ms = queued.as_millis() as u64, "Waited for previous prediction");
        }
        let started = Instant::now();

        let mut template = WorkflowTemplate::load(&self.paths.workflow)?;
        self.bindings.validate(&template)?;

        let removed = clear_output_dir(&self.paths.output_dir);
        debug!(dir = %self.paths.output_dir.display(), removed, "Cleared output directory");

        let staged = InputStager::new(&self.paths.input_dir)
            .stage(&request.input_image, request.audio_file.as_deref())?;

        let audio = match &staged.audio {
            Some(name) => Value::from(name.as_str()),
            None => self
                .bindings
                .current(&template, Parameter::Audio)
                .cloned()
                .unwrap_or(Value::Null),
        };

        let mut values = PatchValues::new();
        values
            .set(Parameter::Image, staged.image.as_str())
            .set(Parameter::Audio, audio)
            .set(Parameter::PositivePrompt, request.prompt.as_str())
            .set(Parameter::NegativePrompt, request.negative_prompt.as_str())
            .set(Parameter::Seed, seed)
            .set(Parameter::Steps, request.steps)
            .set(Parameter::Cfg, request.cfg_scale)
            .set(Parameter::NumFrames, request.num_frames)
            .set(Parameter::Fps, request.fps);
        self.bindings.apply(&mut template, &values)?;

        info!(
            seed,
            image = %staged.image,
            audio = staged.audio.as_deref().unwrap_or("<template default>"),
            num_frames = request.num_frames,
            fps = request.fps,
            steps = request.steps,
            cfg_scale = request.cfg_scale,
            "Running workflow"
        );

        let prompt_id = Uuid::new_v4().to_string();
        let report = self.engine.execute(&template, &prompt_id).map_err(|err| {
            warn!(prompt_id = %prompt_id, error = %err, "Workflow execution failed");
            PredictError::Execution(err)
        })?;

        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }

        let output = match select_reported_video(&self.paths.output_dir, &report.outputs) {
            Some(path) => path,
            None => {
                if !report.outputs.is_empty() {
                    debug!(reported = ?report.outputs, "Reported outputs unusable; scanning output directory");
                }
                locate_latest_video(&self.paths.output_dir)?
            }
        };

        let elapsed = started.elapsed();
        info!(
            prompt_id = %report.prompt_id,
            output = %output.display(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Prediction finished"
        );

        Ok(Prediction {
            id: prediction_id,
            output,
            seed,
            elapsed,
        })
    }
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor")
            .field("paths", &self.paths)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}
