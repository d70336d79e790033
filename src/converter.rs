//! dcm2nii / dcm2niix integration for DICOM to NIfTI conversion.
//!
//! Both converters print what they wrote instead of returning it, so the
//! output record is recovered from stdout by the scrapers in
//! [`crate::scraper`].

use crate::command::{CommandLine, CommandOutput, OutputField, OutputRecord, RunContext};
use crate::error::Result;
use crate::filemanip::absolute;
use crate::schema::{
    find_field, DefaultValue, FieldKind, FieldSpec, InputRecord, Value, EXTRA_ARGS,
};
use crate::scraper::{scrape, Compression, ConvertedFiles, Dcm2niiScraper, Dcm2niixScraper};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Name of the preferences file generated for dcm2nii.
pub const DCM2NII_CONFIG_FILE: &str = "config.ini";
/// Disables dcm2nii's interactive mode.
const DCM2NII_CONFIG_CONTENT: &str = "[BOOL]\nManualNIfTIConv=0\n";

pub const DCM2NII_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("source_dir", FieldKind::Directory)
        .arg("%s")
        .at(10)
        .required()
        .xor(&["source_names"])
        .exists(),
    FieldSpec::new("source_names", FieldKind::FileList)
        .arg("%s")
        .at(10)
        .required()
        .xor(&["source_dir"])
        .bounds(1, None)
        .exists(),
    FieldSpec::new("gzip_output", FieldKind::YesNo)
        .arg("-g")
        .at(0)
        .default(DefaultValue::Bool(false)),
    FieldSpec::new("nii_output", FieldKind::YesNo)
        .arg("-n")
        .at(1)
        .default(DefaultValue::Bool(true)),
    FieldSpec::new("anonymize", FieldKind::YesNo).arg("-a").at(2),
    FieldSpec::new("id_in_filename", FieldKind::YesNo)
        .arg("-i")
        .at(3)
        .default(DefaultValue::Bool(false)),
    FieldSpec::new("reorient", FieldKind::YesNo).arg("-r").at(4),
    FieldSpec::new("reorient_and_crop", FieldKind::YesNo).arg("-x").at(5),
    FieldSpec::new("output_dir", FieldKind::Directory)
        .arg("-o %s")
        .at(6)
        .generated()
        .exists(),
    FieldSpec::new("config_file", FieldKind::File)
        .arg("-b %s")
        .at(7)
        .generated()
        .exists(),
    FieldSpec::new("convert_all_pars", FieldKind::YesNo).arg("-v").at(8),
    EXTRA_ARGS.at(9),
];

pub const DCM2NII_OUTPUTS: &[OutputField] = &[
    OutputField::new("converted_files", "Converted NIfTI/Analyze images"),
    OutputField::new("reoriented_files", "Reoriented images"),
    OutputField::new("reoriented_and_cropped_files", "Reoriented and cropped images"),
    OutputField::new("bvecs", "Gradient direction tables"),
    OutputField::new("bvals", "Gradient b-value tables"),
];

/// The working directory, or `output_dir` resolved against it.
fn resolved_output_dir(inputs: &InputRecord, ctx: &RunContext) -> PathBuf {
    match inputs.text("output_dir") {
        Some(dir) => absolute(&ctx.cwd, dir),
        None => ctx.cwd.clone(),
    }
}

/// Wrapper for Chris Rorden's classic `dcm2nii`.
#[derive(Debug, Clone)]
pub struct Dcm2nii {
    inputs: InputRecord,
}

impl Dcm2nii {
    pub fn new(inputs: InputRecord) -> Self {
        Self { inputs }
    }

    /// Recover converted file paths from captured stdout.
    pub fn parse_stdout(&self, ctx: &RunContext, stdout: &str) -> ConvertedFiles {
        scrape(
            Dcm2niiScraper::new(resolved_output_dir(&self.inputs, ctx)),
            stdout,
        )
    }
}

impl CommandLine for Dcm2nii {
    fn name(&self) -> &'static str {
        "dcm2nii"
    }

    fn default_binary(&self) -> &'static str {
        "dcm2nii"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        DCM2NII_FIELDS
    }

    fn output_fields(&self) -> &'static [OutputField] {
        DCM2NII_OUTPUTS
    }

    fn inputs(&self) -> &InputRecord {
        &self.inputs
    }

    fn generated_value(&self, field: &FieldSpec, ctx: &RunContext) -> Option<Value> {
        match field.name {
            "output_dir" => Some(Value::from(ctx.cwd.as_path())),
            "config_file" => Some(Value::from(ctx.cwd.join(DCM2NII_CONFIG_FILE))),
            _ => None,
        }
    }

    fn prepare(&self, ctx: &RunContext) -> Result<()> {
        if !self.inputs.is_set("config_file") {
            let path = ctx.cwd.join(DCM2NII_CONFIG_FILE);
            fs::write(&path, DCM2NII_CONFIG_CONTENT)?;
            debug!(path = %path.display(), "Wrote non-interactive dcm2nii config");
        }
        Ok(())
    }

    fn list_outputs(&self, ctx: &RunContext, output: &CommandOutput) -> Result<OutputRecord> {
        let files = self.parse_stdout(ctx, &output.stdout);
        let mut outputs = OutputRecord::new();
        outputs.insert_paths("converted_files", files.converted);
        outputs.insert_paths("reoriented_files", files.reoriented);
        outputs.insert_paths("reoriented_and_cropped_files", files.reoriented_and_cropped);
        outputs.insert_paths("bvecs", files.bvecs);
        outputs.insert_paths("bvals", files.bvals);
        Ok(outputs)
    }
}

pub const DCM2NIIX_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("bids_format", FieldKind::YesNo)
        .arg("-b")
        .default(DefaultValue::Bool(true))
        .desc("Create a BIDS sidecar file"),
    FieldSpec::new("compress", FieldKind::Choice(&["y", "i", "n"]))
        .arg("-z %s")
        .default(DefaultValue::Text("i"))
        .desc("Gzip compress images - [y=pigz, i=internal, n=no]"),
    FieldSpec::new("crop", FieldKind::YesNo)
        .arg("-x")
        .default(DefaultValue::Bool(false))
        .desc("Crop 3D T1 acquisitions"),
    FieldSpec::new("has_private", FieldKind::YesNo)
        .arg("-t")
        .default(DefaultValue::Bool(false))
        .desc("Flag if text notes includes private patient details"),
    FieldSpec::new("merge_imgs", FieldKind::YesNo)
        .arg("-m")
        .default(DefaultValue::Bool(false))
        .desc("Merge 2D slices from same series"),
    FieldSpec::new("out_filename", FieldKind::Text)
        .arg("-f %s")
        .default(DefaultValue::Text("%t%p"))
        .desc("Output filename"),
    FieldSpec::new("output_dir", FieldKind::Directory)
        .arg("-o %s")
        .generated()
        .exists()
        .desc("Output directory"),
    FieldSpec::new("single_file", FieldKind::YesNo)
        .arg("-s")
        .default(DefaultValue::Bool(false))
        .desc("Convert only one image (filename as last input)"),
    FieldSpec::new("verbose", FieldKind::YesNo)
        .arg("-v")
        .default(DefaultValue::Bool(false))
        .desc("Verbose output"),
    FieldSpec::new("source_names", FieldKind::FileList)
        .arg("%s")
        .at(-1)
        .required()
        .xor(&["source_dir"])
        .bounds(1, None)
        .exists()
        .first_only(),
    FieldSpec::new("source_dir", FieldKind::Directory)
        .arg("%s")
        .at(-1)
        .required()
        .xor(&["source_names"])
        .exists(),
    EXTRA_ARGS,
];

pub const DCM2NIIX_OUTPUTS: &[OutputField] = &[
    OutputField::new("converted_files", "Converted NIfTI images"),
    OutputField::new("bvecs", "Gradient direction tables"),
    OutputField::new("bvals", "Gradient b-value tables"),
    OutputField::new("bids", "BIDS JSON sidecars (only when bids_format is on)"),
];

/// Wrapper for `dcm2niix`.
///
/// With the defaults the command line reads
/// `dcm2niix -b y -z i -x n -t n -m n -f %t%p -o <cwd> -s n -v n <source>`.
#[derive(Debug, Clone)]
pub struct Dcm2niix {
    inputs: InputRecord,
}

impl Dcm2niix {
    pub fn new(inputs: InputRecord) -> Self {
        Self { inputs }
    }

    pub fn compression(&self) -> Compression {
        self.inputs
            .text("compress")
            .and_then(Compression::from_flag)
            .unwrap_or_default()
    }

    pub fn bids_format(&self) -> bool {
        find_field(DCM2NIIX_FIELDS, "bids_format")
            .map(|field| self.inputs.flag(field))
            .unwrap_or(true)
    }

    /// Recover converted file paths from captured stdout.
    pub fn parse_stdout(&self, ctx: &RunContext, stdout: &str) -> ConvertedFiles {
        scrape(
            Dcm2niixScraper::new(
                resolved_output_dir(&self.inputs, ctx),
                self.compression(),
                self.bids_format(),
            ),
            stdout,
        )
    }
}

impl CommandLine for Dcm2niix {
    fn name(&self) -> &'static str {
        "dcm2niix"
    }

    fn default_binary(&self) -> &'static str {
        "dcm2niix"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        DCM2NIIX_FIELDS
    }

    fn output_fields(&self) -> &'static [OutputField] {
        DCM2NIIX_OUTPUTS
    }

    fn inputs(&self) -> &InputRecord {
        &self.inputs
    }

    fn generated_value(&self, field: &FieldSpec, ctx: &RunContext) -> Option<Value> {
        (field.name == "output_dir").then(|| Value::from(ctx.cwd.as_path()))
    }

    fn list_outputs(&self, ctx: &RunContext, output: &CommandOutput) -> Result<OutputRecord> {
        let files = self.parse_stdout(ctx, &output.stdout);
        let mut outputs = OutputRecord::new();
        outputs.insert_paths("converted_files", files.converted);
        outputs.insert_paths("bvecs", files.bvecs);
        outputs.insert_paths("bvals", files.bvals);
        if self.bids_format() {
            outputs.insert_paths("bids", files.bids);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{arguments, command_line};
    use crate::error::AdapterError;
    use std::path::Path;

    fn scratch_with_dicoms() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("functional_1.dcm"), b"").unwrap();
        fs::write(dir.path().join("functional_2.dcm"), b"").unwrap();
        fs::create_dir(dir.path().join("dicom")).unwrap();
        dir
    }

    #[test]
    fn test_dcm2niix_command_line_matches_defaults() {
        let dir = scratch_with_dicoms();
        let converter = Dcm2niix::new(
            InputRecord::new()
                .with("source_names", vec!["functional_1.dcm", "functional_2.dcm"])
                .with("compress", "i")
                .with("single_file", true)
                .with("output_dir", "."),
        );
        let ctx = RunContext::new(dir.path());
        assert_eq!(
            command_line(&converter, &ctx).unwrap(),
            "dcm2niix -b y -z i -x n -t n -m n -f %t%p -o . -s y -v n functional_1.dcm"
        );
    }

    #[test]
    fn test_dcm2niix_generates_output_dir_from_cwd() {
        let dir = scratch_with_dicoms();
        let converter = Dcm2niix::new(InputRecord::new().with("source_dir", "dicom"));
        let ctx = RunContext::new(dir.path());
        let args = arguments(&converter, &ctx).unwrap();
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(Path::new(&args[o + 1]), dir.path());
        assert_eq!(args.last().map(String::as_str), Some("dicom"));
    }

    #[test]
    fn test_dcm2niix_rejects_both_sources() {
        let dir = scratch_with_dicoms();
        let converter = Dcm2niix::new(
            InputRecord::new()
                .with("source_dir", "dicom")
                .with("source_names", vec!["functional_1.dcm"]),
        );
        let err = arguments(&converter, &RunContext::new(dir.path())).unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
    }

    #[test]
    fn test_empty_source_names_rejected() {
        let dir = scratch_with_dicoms();
        let ctx = RunContext::new(dir.path());
        let empty = || InputRecord::new().with("source_names", Vec::<String>::new());

        let err = arguments(&Dcm2niix::new(empty()), &ctx).unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
        let err = arguments(&Dcm2nii::new(empty()), &ctx).unwrap_err();
        assert!(matches!(err, AdapterError::Configuration(_)));
    }

    #[test]
    fn test_dcm2niix_outputs_absolute_from_relative_cwd() {
        let converter = Dcm2niix::new(InputRecord::new().with("source_dir", "dicom"));
        let ctx = RunContext::new(".");
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "Convert SUBJ/img\n".into(),
            ..Default::default()
        };
        let outputs = converter.list_outputs(&ctx, &output).unwrap();
        let expected = std::env::current_dir().unwrap().join("SUBJ/img.nii.gz");
        assert!(expected.is_absolute());
        assert_eq!(outputs.paths("converted_files"), vec![expected.as_path()]);
    }

    #[test]
    fn test_dcm2niix_outputs_follow_compression_and_bids() {
        let converter = Dcm2niix::new(
            InputRecord::new()
                .with("source_dir", "dicom")
                .with("compress", "n")
                .with("bids_format", false),
        );
        let ctx = RunContext::new("/data/out");
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "Convert SUBJ/img\n".into(),
            ..Default::default()
        };
        let outputs = converter.list_outputs(&ctx, &output).unwrap();
        assert_eq!(
            outputs.paths("converted_files"),
            vec![Path::new("/data/out/SUBJ/img.nii")]
        );
        assert!(outputs.get("bids").is_none());
    }

    #[test]
    fn test_dcm2nii_yes_no_flags_and_positions() {
        let dir = scratch_with_dicoms();
        let converter = Dcm2nii::new(
            InputRecord::new()
                .with("source_dir", "dicom")
                .with("reorient", true)
                .with("anonymize", false),
        );
        let ctx = RunContext::new(dir.path());
        let args = arguments(&converter, &ctx).unwrap();
        let cwd = dir.path().to_string_lossy().to_string();
        let config = dir.path().join(DCM2NII_CONFIG_FILE).to_string_lossy().to_string();
        assert_eq!(
            args,
            vec![
                "-g", "n", "-n", "y", "-a", "n", "-i", "n", "-r", "y", "-o", cwd.as_str(), "-b",
                config.as_str(),
                "dicom"
            ]
        );
    }

    #[test]
    fn test_dcm2nii_prepare_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        let converter = Dcm2nii::new(InputRecord::new());
        converter.prepare(&RunContext::new(dir.path())).unwrap();
        let written = fs::read_to_string(dir.path().join(DCM2NII_CONFIG_FILE)).unwrap();
        assert_eq!(written, "[BOOL]\nManualNIfTIConv=0\n");
    }

    #[test]
    fn test_dcm2nii_lists_scraped_outputs() {
        let converter = Dcm2nii::new(InputRecord::new().with("output_dir", "out"));
        let ctx = RunContext::new("/work");
        let output = CommandOutput {
            exit_code: Some(0),
            stdout: "GZip...dti.nii.gz\nNumber of diffusion directions 30\n".into(),
            ..Default::default()
        };
        let outputs = converter.list_outputs(&ctx, &output).unwrap();
        assert_eq!(
            outputs.paths("converted_files"),
            vec![Path::new("/work/out/dti.nii.gz")]
        );
        assert_eq!(outputs.paths("bvecs"), vec![Path::new("/work/out/dti.bvec")]);
        assert_eq!(outputs.paths("bvals"), vec![Path::new("/work/out/dti.bval")]);
        assert!(outputs.paths("reoriented_files").is_empty());
    }
}
