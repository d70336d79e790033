//! Connectome Mapper parcellation.
//!
//! Unlike the other adapters this is not a single command line: a scheme
//! expands into a fixed sequence of cmtklib steps, each run through a
//! [`ParcellationBackend`]. Output names depend on the resolutions the
//! scheme defines, looked up through a [`SchemeRegistry`].

use crate::command::{execute, verify_outputs, OutputField, OutputRecord};
use crate::error::{AdapterError, Result};
use crate::filemanip::{absolute, absolute_from_cwd};
use crate::schema::{validate, DefaultValue, FieldKind, FieldSpec, InputRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

pub const WHITE_MATTER_MASK: &str = "fsmask_1mm.nii.gz";
pub const ROI_PREFIX: &str = "ROIv_HR_th";

pub const PARCELLATE_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("subjects_dir", FieldKind::Directory).desc("Freesurfer main directory"),
    FieldSpec::new("subject_id", FieldKind::Text)
        .required()
        .desc("Subject ID"),
    FieldSpec::new(
        "parcellation_scheme",
        FieldKind::Choice(&["Lausanne2008", "NativeFreesurfer"]),
    )
    .default(DefaultValue::Text("Lausanne2008"))
    .desc("Parcellation scheme"),
];

pub const PARCELLATE_OUTPUTS: &[OutputField] = &[
    OutputField::new("white_matter_mask_file", "White matter mask file").optional(),
    OutputField::new(
        "roi_files_in_structural_space",
        "ROI image resliced to the dimensions of the original structural image",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scheme {
    #[default]
    Lausanne2008,
    NativeFreesurfer,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Lausanne2008 => "Lausanne2008",
            Scheme::NativeFreesurfer => "NativeFreesurfer",
        }
    }

    /// The cmtklib steps this scheme runs, in order.
    pub fn steps(&self) -> &'static [Step] {
        match self {
            Scheme::Lausanne2008 => &[
                Step::CreateAnnotLabel,
                Step::CreateRoi,
                Step::CreateWmMask,
                Step::CropAndMoveDatasets,
            ],
            Scheme::NativeFreesurfer => &[Step::GenerateWmAndGmMask, Step::CropAndMoveWmAndGm],
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Lausanne2008" => Ok(Scheme::Lausanne2008),
            "NativeFreesurfer" => Ok(Scheme::NativeFreesurfer),
            other => Err(AdapterError::config(format!(
                "Unknown parcellation scheme `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    CreateAnnotLabel,
    CreateRoi,
    CreateWmMask,
    CropAndMoveDatasets,
    GenerateWmAndGmMask,
    CropAndMoveWmAndGm,
}

impl Step {
    /// Function name in `cmtklib.parcellation`.
    pub fn function(&self) -> &'static str {
        match self {
            Step::CreateAnnotLabel => "create_annot_label",
            Step::CreateRoi => "create_roi",
            Step::CreateWmMask => "create_wm_mask",
            Step::CropAndMoveDatasets => "crop_and_move_datasets",
            Step::GenerateWmAndGmMask => "generate_WM_and_GM_mask",
            Step::CropAndMoveWmAndGm => "crop_and_move_WM_and_GM",
        }
    }
}

/// Resolution names per scheme.
pub trait SchemeRegistry: Send + Sync {
    fn resolutions(&self, scheme: Scheme) -> Vec<String>;
}

/// The resolutions shipped with cmtklib.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSchemes;

impl SchemeRegistry for BuiltinSchemes {
    fn resolutions(&self, scheme: Scheme) -> Vec<String> {
        let names: &[&str] = match scheme {
            Scheme::Lausanne2008 => &["scale33", "scale60", "scale125", "scale250", "scale500"],
            Scheme::NativeFreesurfer => &["freesurferaparc"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }
}

/// Executes a single parcellation step.
#[async_trait]
pub trait ParcellationBackend: Send + Sync {
    async fn run_step(
        &self,
        step: Step,
        subject_id: &str,
        subjects_dir: Option<&Path>,
        cwd: &Path,
    ) -> Result<()>;
}

/// Calls cmtklib through a Python interpreter, one process per step.
#[derive(Debug, Clone)]
pub struct CmtkPythonBackend {
    python: String,
}

impl CmtkPythonBackend {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    /// Interpreter arguments for one step. Subject and directory travel in
    /// `sys.argv` and are never spliced into the script text.
    pub fn arguments(step: Step, subject_id: &str, subjects_dir: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            format!(
                "import sys; from cmtklib.parcellation import {f}; \
                 {f}(sys.argv[1], sys.argv[2] if len(sys.argv) > 2 else None)",
                f = step.function()
            ),
            subject_id.to_string(),
        ];
        if let Some(dir) = subjects_dir {
            args.push(dir.to_string_lossy().to_string());
        }
        args
    }
}

impl Default for CmtkPythonBackend {
    fn default() -> Self {
        Self::new("python")
    }
}

#[async_trait]
impl ParcellationBackend for CmtkPythonBackend {
    async fn run_step(
        &self,
        step: Step,
        subject_id: &str,
        subjects_dir: Option<&Path>,
        cwd: &Path,
    ) -> Result<()> {
        let args = Self::arguments(step, subject_id, subjects_dir);
        let output = execute(&self.python, &args, cwd).await?;
        if !output.success() {
            return Err(AdapterError::Execution {
                command: format!("{} ({})", self.python, step.function()),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Parcellation of one FreeSurfer subject.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcellate {
    pub subject_id: String,
    pub subjects_dir: Option<PathBuf>,
    pub scheme: Scheme,
}

impl Parcellate {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            subjects_dir: None,
            scheme: Scheme::default(),
        }
    }

    pub fn with_subjects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.subjects_dir = Some(dir.into());
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Build from generic inputs, validated against [`PARCELLATE_FIELDS`].
    pub fn from_inputs(inputs: &InputRecord, base: &Path) -> Result<Self> {
        validate(PARCELLATE_FIELDS, inputs, base)?;
        // validate() guarantees subject_id is present text
        let subject_id = inputs.text("subject_id").unwrap_or_default();
        let scheme = match inputs.text("parcellation_scheme") {
            Some(s) => s.parse()?,
            None => Scheme::default(),
        };
        Ok(Self {
            subject_id: subject_id.to_string(),
            subjects_dir: inputs.text("subjects_dir").map(PathBuf::from),
            scheme,
        })
    }

    /// Expected outputs, absolute against `cwd`.
    pub fn list_outputs(&self, registry: &dyn SchemeRegistry, cwd: &Path) -> OutputRecord {
        let cwd = absolute_from_cwd(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let mut outputs = OutputRecord::new();
        outputs.insert_path("white_matter_mask_file", cwd.join(WHITE_MATTER_MASK));
        let rois = registry
            .resolutions(self.scheme)
            .iter()
            .map(|scale| cwd.join(format!("{}_{}.nii.gz", ROI_PREFIX, scale)))
            .collect();
        outputs.insert_paths("roi_files_in_structural_space", rois);
        outputs
    }

    pub async fn run(
        &self,
        backend: &dyn ParcellationBackend,
        registry: &dyn SchemeRegistry,
        cwd: &Path,
    ) -> Result<OutputRecord> {
        let cwd = absolute_from_cwd(cwd)?;
        let cwd = cwd.as_path();
        let subjects_dir = self.subjects_dir.as_ref().map(|d| absolute(cwd, d));
        info!(
            subject = %self.subject_id,
            scheme = %self.scheme,
            "ROI_HR_th.nii.gz / fsmask_1mm.nii.gz creation"
        );

        for step in self.scheme.steps() {
            info!(step = step.function(), "Running parcellation step");
            backend
                .run_step(*step, &self.subject_id, subjects_dir.as_deref(), cwd)
                .await?;
        }

        let outputs = self.list_outputs(registry, cwd);
        verify_outputs(PARCELLATE_OUTPUTS, &outputs)?;
        Ok(outputs)
    }
}
