//! Workflow template loading and parameter patching.
//!
//! The template is the host's API-format graph: a JSON object mapping node ids
//! to `{"class_type": ..., "inputs": {...}}`. Request values reach the graph
//! through a [`BindingTable`] that names, for each semantic parameter, the
//! node inputs it overwrites. The table is checked against every freshly
//! loaded template so a renumbered graph fails before anything is executed.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::TemplateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    Image,
    Audio,
    PositivePrompt,
    NegativePrompt,
    Seed,
    Steps,
    Cfg,
    NumFrames,
    Fps,
}

impl Parameter {
    pub const ALL: [Parameter; 9] = [
        Parameter::Image,
        Parameter::Audio,
        Parameter::PositivePrompt,
        Parameter::NegativePrompt,
        Parameter::Seed,
        Parameter::Steps,
        Parameter::Cfg,
        Parameter::NumFrames,
        Parameter::Fps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
            Self::PositivePrompt => "positive_prompt",
            Self::NegativePrompt => "negative_prompt",
            Self::Seed => "seed",
            Self::Steps => "steps",
            Self::Cfg => "cfg",
            Self::NumFrames => "num_frames",
            Self::Fps => "fps",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Parameter::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| TemplateError::UnknownParameter(s.to_string()))
    }
}

/// One `(node id, input field)` location inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldBinding {
    pub node: String,
    pub field: String,
}

impl FieldBinding {
    pub fn new(node: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    pub inputs: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Node id → node configuration, in the host's API format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowTemplate {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowTemplate {
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let template = Self::parse(&raw).map_err(|err| TemplateError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if template.is_empty() {
            return Err(TemplateError::Parse {
                path: path.to_path_buf(),
                message: "template contains no nodes".to_string(),
            });
        }
        debug!(path = %path.display(), nodes = template.len(), "Loaded workflow template");
        Ok(template)
    }

    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn input(&self, binding: &FieldBinding) -> Option<&Value> {
        self.nodes.get(&binding.node)?.inputs.get(&binding.field)
    }

    fn input_mut(&mut self, binding: &FieldBinding) -> Option<&mut Value> {
        self.nodes.get_mut(&binding.node)?.inputs.get_mut(&binding.field)
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Semantic parameter → template locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTable {
    bindings: BTreeMap<Parameter, Vec<FieldBinding>>,
}

impl Default for BindingTable {
    /// Locations in the bundled InfiniteTalk template. Frame rate is bound
    /// twice so the sampler and the video encoder never disagree.
    fn default() -> Self {
        let bindings = BTreeMap::from([
            (Parameter::Image, vec![FieldBinding::new("12", "image")]),
            (Parameter::Audio, vec![FieldBinding::new("19", "audio")]),
            (
                Parameter::PositivePrompt,
                vec![FieldBinding::new("17", "positive_prompt")],
            ),
            (
                Parameter::NegativePrompt,
                vec![FieldBinding::new("17", "negative_prompt")],
            ),
            (Parameter::Seed, vec![FieldBinding::new("16", "seed")]),
            (Parameter::Steps, vec![FieldBinding::new("16", "steps")]),
            (Parameter::Cfg, vec![FieldBinding::new("16", "cfg")]),
            (
                Parameter::NumFrames,
                vec![FieldBinding::new("18", "num_frames")],
            ),
            (
                Parameter::Fps,
                vec![
                    FieldBinding::new("18", "fps"),
                    FieldBinding::new("23", "frame_rate"),
                ],
            ),
        ]);
        Self { bindings }
    }
}

impl BindingTable {
    /// Default table with the given parameters' locations replaced. Every
    /// parameter keeps at least one location.
    pub fn with_overrides(
        overrides: &BTreeMap<String, Vec<FieldBinding>>,
    ) -> Result<Self, TemplateError> {
        let mut table = Self::default();
        for (name, locations) in overrides {
            let parameter = name.parse::<Parameter>()?;
            if locations.is_empty() {
                return Err(TemplateError::EmptyBinding(parameter));
            }
            table.bindings.insert(parameter, locations.clone());
        }
        Ok(table)
    }

    pub fn locations(&self, parameter: Parameter) -> &[FieldBinding] {
        self.bindings
            .get(&parameter)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Checks that every bound node and input exists in `template`.
    pub fn validate(&self, template: &WorkflowTemplate) -> Result<(), TemplateError> {
        for (&parameter, locations) in &self.bindings {
            for binding in locations {
                let Some(node) = template.node(&binding.node) else {
                    return Err(TemplateError::MissingNode {
                        parameter,
                        node: binding.node.clone(),
                    });
                };
                if !node.inputs.contains_key(&binding.field) {
                    return Err(TemplateError::MissingField {
                        parameter,
                        node: binding.node.clone(),
                        field: binding.field.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Current value at the parameter's first location.
    pub fn current<'a>(
        &self,
        template: &'a WorkflowTemplate,
        parameter: Parameter,
    ) -> Option<&'a Value> {
        self.locations(parameter)
            .first()
            .and_then(|binding| template.input(binding))
    }

    /// Writes each value to all locations bound to its parameter.
    pub fn apply(
        &self,
        template: &mut WorkflowTemplate,
        values: &PatchValues,
    ) -> Result<(), TemplateError> {
        for (&parameter, value) in &values.0 {
            for binding in self.locations(parameter) {
                match template.input_mut(binding) {
                    Some(slot) => *slot = value.clone(),
                    None => return Err(missing_location(template, parameter, binding)),
                }
            }
        }
        Ok(())
    }
}

fn missing_location(
    template: &WorkflowTemplate,
    parameter: Parameter,
    binding: &FieldBinding,
) -> TemplateError {
    if template.node(&binding.node).is_none() {
        TemplateError::MissingNode {
            parameter,
            node: binding.node.clone(),
        }
    } else {
        TemplateError::MissingField {
            parameter,
            node: binding.node.clone(),
            field: binding.field.clone(),
        }
    }
}

/// Values to write into a template, keyed by parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatchValues(BTreeMap<Parameter, Value>);

impl PatchValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, parameter: Parameter, value: impl Into<Value>) -> &mut Self {
        self.0.insert(parameter, value.into());
        self
    }

    pub fn get(&self, parameter: Parameter) -> Option<&Value> {
        self.0.get(&parameter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_template() -> WorkflowTemplate {
        serde_json::from_value(json!({
            "12": {"class_type": "LoadImage", "inputs": {"image": "example.png", "upload": "image"}},
            "16": {"class_type": "WanVideoSampler", "inputs": {"seed": 1, "steps": 4, "cfg": 6.0, "model": ["11", 0]}},
            "17": {"class_type": "WanVideoTextEncode", "inputs": {"positive_prompt": "old", "negative_prompt": "old neg"}},
            "18": {"class_type": "WanVideoImageToVideoMultiTalk", "inputs": {"num_frames": 81, "fps": 16}},
            "19": {"class_type": "LoadAudio", "inputs": {"audio": "default.wav"}},
            "23": {
                "class_type": "VHS_VideoCombine",
                "inputs": {"frame_rate": 16, "format": "video/h264-mp4"},
                "_meta": {"title": "Video Combine"}
            }
        }))
        .expect("sample template")
    }

    fn full_values() -> PatchValues {
        let mut values = PatchValues::new();
        values
            .set(Parameter::Image, "input_abc.webp")
            .set(Parameter::Audio, "input_def.wav")
            .set(Parameter::PositivePrompt, "a person is speaking")
            .set(Parameter::NegativePrompt, "blurry")
            .set(Parameter::Seed, 42u64)
            .set(Parameter::Steps, 6u32)
            .set(Parameter::Cfg, 1.0)
            .set(Parameter::NumFrames, 100u32)
            .set(Parameter::Fps, 25u32);
        values
    }

    #[test]
    fn default_table_matches_sample_template() {
        BindingTable::default()
            .validate(&sample_template())
            .expect("default bindings valid");
    }

    #[test]
    fn bundled_template_satisfies_default_bindings() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../workflow_api.json");
        let template = WorkflowTemplate::load(&path).expect("bundled template");
        BindingTable::default()
            .validate(&template)
            .expect("bundled template carries every bound input");
    }

    #[test]
    fn apply_overwrites_every_bound_field() {
        let mut template = sample_template();
        let table = BindingTable::default();
        table.apply(&mut template, &full_values()).expect("apply");

        let at = |node: &str, field: &str| template.input(&FieldBinding::new(node, field)).cloned();
        assert_eq!(at("12", "image"), Some(json!("input_abc.webp")));
        assert_eq!(at("19", "audio"), Some(json!("input_def.wav")));
        assert_eq!(at("17", "positive_prompt"), Some(json!("a person is speaking")));
        assert_eq!(at("17", "negative_prompt"), Some(json!("blurry")));
        assert_eq!(at("16", "seed"), Some(json!(42)));
        assert_eq!(at("16", "steps"), Some(json!(6)));
        assert_eq!(at("16", "cfg"), Some(json!(1.0)));
        assert_eq!(at("18", "num_frames"), Some(json!(100)));
    }

    #[test]
    fn fps_reaches_sampler_and_encoder() {
        let mut template = sample_template();
        BindingTable::default()
            .apply(&mut template, &full_values())
            .expect("apply");

        assert_eq!(template.input(&FieldBinding::new("18", "fps")), Some(&json!(25)));
        assert_eq!(
            template.input(&FieldBinding::new("23", "frame_rate")),
            Some(&json!(25))
        );
    }

    #[test]
    fn apply_leaves_unbound_fields_and_metadata_alone() {
        let mut template = sample_template();
        BindingTable::default()
            .apply(&mut template, &full_values())
            .expect("apply");

        let combine = template.node("23").expect("node 23");
        assert_eq!(combine.inputs["format"], json!("video/h264-mp4"));
        assert_eq!(combine.extra["_meta"], json!({"title": "Video Combine"}));
        assert_eq!(
            template.input(&FieldBinding::new("16", "model")),
            Some(&json!(["11", 0]))
        );
    }

    #[test]
    fn validate_reports_missing_node() {
        let mut raw = sample_template().to_value().unwrap();
        raw.as_object_mut().unwrap().remove("23");
        let template: WorkflowTemplate = serde_json::from_value(raw).unwrap();

        let err = BindingTable::default().validate(&template).unwrap_err();
        match err {
            TemplateError::MissingNode { parameter, node } => {
                assert_eq!(parameter, Parameter::Fps);
                assert_eq!(node, "23");
            }
            other => panic!("expected MissingNode, got {other:?}"),
        }
    }

    #[test]
    fn validate_reports_missing_field() {
        let mut raw = sample_template().to_value().unwrap();
        raw["16"]["inputs"].as_object_mut().unwrap().remove("cfg");
        let template: WorkflowTemplate = serde_json::from_value(raw).unwrap();

        let err = BindingTable::default().validate(&template).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::MissingField { parameter: Parameter::Cfg, ref field, .. } if field == "cfg"
        ));
        assert!(err.to_string().contains("bound to parameter 'cfg'"));
    }

    #[test]
    fn current_reads_template_default() {
        let template = sample_template();
        let current = BindingTable::default().current(&template, Parameter::Audio);
        assert_eq!(current, Some(&json!("default.wav")));
    }

    #[test]
    fn overrides_replace_only_named_parameters() {
        let overrides = BTreeMap::from([(
            "fps".to_string(),
            vec![FieldBinding::new("40", "fps")],
        )]);
        let table = BindingTable::with_overrides(&overrides).expect("overrides");
        assert_eq!(table.locations(Parameter::Fps), &[FieldBinding::new("40", "fps")]);
        assert_eq!(
            table.locations(Parameter::Image),
            &[FieldBinding::new("12", "image")]
        );
    }

    #[test]
    fn overrides_reject_unknown_parameter() {
        let overrides = BTreeMap::from([("denoise".to_string(), vec![])]);
        let err = BindingTable::with_overrides(&overrides).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownParameter(ref name) if name == "denoise"));
    }

    #[test]
    fn overrides_reject_empty_location_list() {
        let overrides = BTreeMap::from([("fps".to_string(), vec![])]);
        let err = BindingTable::with_overrides(&overrides).unwrap_err();
        assert!(matches!(err, TemplateError::EmptyBinding(Parameter::Fps)));
        assert!(err.to_string().contains("'fps'"));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkflowTemplate::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, TemplateError::Io { .. }));
    }

    #[test]
    fn load_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow_api.json");
        fs::write(&path, r#"{"12": {"class_type": "LoadImage"}}"#).unwrap();
        let err = WorkflowTemplate::load(&path).unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));

        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            WorkflowTemplate::load(&path).unwrap_err(),
            TemplateError::Parse { .. }
        ));

        fs::write(&path, "{}").unwrap();
        assert!(matches!(
            WorkflowTemplate::load(&path).unwrap_err(),
            TemplateError::Parse { ref message, .. } if message.contains("no nodes")
        ));
    }

    #[test]
    fn parameter_names_round_trip_through_from_str() {
        for parameter in Parameter::ALL {
            assert_eq!(parameter.as_str().parse::<Parameter>().unwrap(), parameter);
        }
    }
}
