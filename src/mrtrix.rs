//! MRtrix preprocessing tools.
//!
//! Every tool is a static [`MrtrixTool`] descriptor: binary, input schema and
//! an output naming rule. The output name is derived from the first input
//! file's base name plus a fixed suffix, placed in the working directory,
//! unless the caller names the output explicitly.

use crate::command::{CommandLine, CommandOutput, OutputField, OutputRecord, RunContext};
use crate::error::Result;
use crate::filemanip::{absolute, fname_presuffix};
use crate::schema::{DefaultValue, FieldKind, FieldSpec, InputRecord, Value, EXTRA_ARGS};
use std::path::PathBuf;

/// How the primary output's suffix is formed.
#[derive(Debug, Clone, Copy)]
pub enum Suffix {
    Fixed(&'static str),
    /// `<stem><value of field>`, e.g. `_mrconvert.` + `mif`.
    FromField {
        stem: &'static str,
        field: &'static str,
        default: &'static str,
    },
}

/// Naming rule for a tool's main output.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryOutput {
    pub slot: &'static str,
    /// Input fields that may hold the source; the first one set is used.
    pub sources: &'static [&'static str],
    /// Input field that names the output explicitly.
    pub override_field: &'static str,
    pub suffix: Suffix,
}

/// Optional output reported only when its input field is set.
#[derive(Debug, Clone, Copy)]
pub struct Companion {
    pub slot: &'static str,
    pub field: &'static str,
}

#[derive(Debug)]
pub struct MrtrixTool {
    pub name: &'static str,
    pub binary: &'static str,
    pub summary: &'static str,
    pub fields: &'static [FieldSpec],
    pub outputs: &'static [OutputField],
    pub primary: Option<PrimaryOutput>,
    pub companions: &'static [Companion],
    /// The tool may exit 0 after a failure and report it only on stderr.
    pub unreliable_exit_status: bool,
}

const QUIET: FieldSpec = FieldSpec::new("quiet", FieldKind::Flag)
    .arg("-quiet")
    .at(1)
    .desc("Do not display information messages or progress status.");

const DEBUG: FieldSpec = FieldSpec::new("debug", FieldKind::Flag)
    .arg("-debug")
    .at(1)
    .desc("Display debugging messages.");

const FORCE: FieldSpec = FieldSpec::new("force_writing", FieldKind::Flag)
    .arg("-force")
    .desc("Force file overwriting.");

const fn input_file(position: i32, desc: &'static str) -> FieldSpec {
    FieldSpec::new("in_file", FieldKind::File)
        .arg("%s")
        .at(position)
        .required()
        .exists()
        .desc(desc)
}

const fn input_files(position: i32, desc: &'static str) -> FieldSpec {
    FieldSpec::new("in_files", FieldKind::FileList)
        .arg("%s")
        .at(position)
        .required()
        .exists()
        .desc(desc)
}

const fn output_file(name: &'static str, template: &'static str, desc: &'static str) -> FieldSpec {
    FieldSpec::new(name, FieldKind::File)
        .arg(template)
        .at(-1)
        .generated()
        .desc(desc)
}

const fn suffixed(
    slot: &'static str,
    source: &'static [&'static str],
    override_field: &'static str,
    suffix: &'static str,
) -> Option<PrimaryOutput> {
    Some(PrimaryOutput {
        slot,
        sources: source,
        override_field,
        suffix: Suffix::Fixed(suffix),
    })
}

pub const DWI_DENOISE: MrtrixTool = MrtrixTool {
    name: "dwidenoise",
    binary: "dwidenoise",
    summary: "Denoise diffusion-weighted images",
    fields: &[
        input_file(-2, "Input diffusion-weighted image filename"),
        output_file("out_file", "%s", "Output denoised DWI image filename."),
        FieldSpec::new("mask", FieldKind::File)
            .arg("-mask %s")
            .at(1)
            .desc("Only perform computation within the specified binary brain mask image."),
        FieldSpec::new("extent_window", FieldKind::FloatList)
            .arg("-extent %s")
            .sep(",")
            .at(2)
            .bounds(3, Some(3))
            .desc("Three comma-separated numbers giving the window size of the denoising filter."),
        FieldSpec::new("out_noisemap", FieldKind::File)
            .arg("-noise %s")
            .at(3)
            .desc("Output noise map filename."),
        FORCE.at(4),
        DEBUG.at(5),
        EXTRA_ARGS,
    ],
    outputs: &[
        OutputField::new("out_file", "Output denoised DWI image."),
        OutputField::new("out_noisemap", "Output noise map (if generated)."),
    ],
    primary: suffixed("out_file", &["in_file"], "out_file", "_denoised.mif"),
    companions: &[Companion {
        slot: "out_noisemap",
        field: "out_noisemap",
    }],
    unreliable_exit_status: true,
};

pub const DWI_BIAS_CORRECT: MrtrixTool = MrtrixTool {
    name: "dwibiascorrect",
    binary: "dwibiascorrect",
    summary: "Correct B1 field inhomogeneity in a DWI series",
    fields: &[
        input_file(-2, "The input image series to be corrected"),
        output_file("out_file", "%s", "The output corrected image series"),
        FieldSpec::new("mask", FieldKind::File)
            .arg("-mask %s")
            .at(2)
            .desc("Manually provide a mask image for bias field estimation"),
        FieldSpec::new("out_bias", FieldKind::File)
            .arg("-bias %s")
            .at(3)
            .desc("Output the estimated bias field"),
        FieldSpec::new("use_ants", FieldKind::Flag)
            .arg("-ants")
            .at(1)
            .xor(&["use_fsl"])
            .desc("Use ANTS N4 to estimate the inhomogeneity field"),
        FieldSpec::new("use_fsl", FieldKind::Flag)
            .arg("-fsl")
            .at(1)
            .xor(&["use_ants"])
            .desc("Use FSL FAST to estimate the inhomogeneity field"),
        FORCE.at(4),
        DEBUG.at(5),
        EXTRA_ARGS,
    ],
    outputs: &[
        OutputField::new("out_file", "Output corrected DWI image"),
        OutputField::new("out_bias", "Output estimated bias field"),
    ],
    primary: suffixed("out_file", &["in_file"], "out_file", "_biascorr.mif"),
    companions: &[Companion {
        slot: "out_bias",
        field: "out_bias",
    }],
    unreliable_exit_status: false,
};

const MRCONVERT_DATATYPES: &[&str] = &[
    "float32", "float32le", "float32be", "float64", "float64le", "float64be", "int64", "uint64",
    "int64le", "uint64le", "int64be", "uint64be", "int32", "uint32", "int32le", "uint32le",
    "int32be", "uint32be", "int16", "uint16", "int16le", "uint16le", "int16be", "uint16be",
    "cfloat32", "cfloat32le", "cfloat32be", "cfloat64", "cfloat64le", "cfloat64be", "int8",
    "uint8", "bit",
];

pub const MR_CONVERT: MrtrixTool = MrtrixTool {
    name: "mrconvert",
    binary: "mrconvert",
    summary: "Convert between image formats and extract subsets of an image",
    fields: &[
        FieldSpec::new("in_file", FieldKind::File)
            .arg("%s")
            .at(-2)
            .required()
            .xor(&["in_dir"])
            .exists()
            .desc("voxel-order data filename"),
        FieldSpec::new("in_dir", FieldKind::Directory)
            .arg("%s")
            .at(-2)
            .required()
            .xor(&["in_file"])
            .exists()
            .desc("directory containing DICOM files"),
        output_file("out_filename", "%s", "Output filename"),
        FieldSpec::new("extract_at_axis", FieldKind::Choice(&["1", "2", "3"]))
            .arg("-coord %s")
            .at(1)
            .desc("Axis to extract at; use with extract_at_coordinate."),
        FieldSpec::new("extract_at_coordinate", FieldKind::FloatList)
            .arg("%s")
            .sep(",")
            .at(2)
            .bounds(1, Some(3))
            .desc("Coordinates to extract at; use with extract_at_axis."),
        FieldSpec::new("voxel_dims", FieldKind::FloatList)
            .arg("-vox %s")
            .sep(",")
            .at(3)
            .bounds(3, Some(3))
            .desc("Three comma-separated numbers giving the size of each voxel in mm."),
        FieldSpec::new("stride", FieldKind::IntList)
            .arg("-stride %s")
            .sep(",")
            .at(3)
            .bounds(3, Some(4))
            .desc("Three to four comma-separated numbers specifying the strides of the output data in memory."),
        FieldSpec::new("output_datatype", FieldKind::Choice(MRCONVERT_DATATYPES))
            .arg("-datatype %s")
            .at(2)
            .desc("Output image data type."),
        FieldSpec::new(
            "extension",
            FieldKind::Choice(&["mif", "nii", "float", "char", "short", "int", "long", "double"]),
        )
        .at(4)
        .default(DefaultValue::Text("mif"))
        .desc("Extension of the generated output name."),
        FieldSpec::new(
            "layout",
            FieldKind::Choice(&["nii", "float", "char", "short", "int", "long", "double"]),
        )
        .arg("-output %s")
        .at(5)
        .desc("Layout of the data in memory."),
        FieldSpec::new("resample", FieldKind::Float)
            .arg("-scale %d")
            .at(6)
            .desc("Apply scaling to the intensity values."),
        FieldSpec::new("offset_bias", FieldKind::Float)
            .arg("-scale %d")
            .at(7)
            .desc("Apply offset to the intensity values."),
        FieldSpec::new("replace_nan_with_zero", FieldKind::Flag)
            .arg("-zero")
            .at(8)
            .desc("Replace all NaN values with zero."),
        FieldSpec::new("prs", FieldKind::Flag)
            .arg("-prs")
            .at(3)
            .desc("Assume that the DW gradients are specified in the PRS frame (Siemens DICOM only)."),
        FieldSpec::new("grad", FieldKind::File)
            .arg("-grad %s")
            .at(9)
            .exists()
            .desc("Gradient encoding as a 4xN text file of [ X Y Z b ] rows."),
        FieldSpec::new("grad_fsl", FieldKind::FilePair)
            .arg("-fslgrad %s %s")
            .exists()
            .desc("[bvecs, bvals] DW gradient scheme (FSL format)"),
        FORCE,
        QUIET,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("converted", "path/name of 4D volume in voxel order")],
    primary: Some(PrimaryOutput {
        slot: "converted",
        sources: &["in_file", "in_dir"],
        override_field: "out_filename",
        suffix: Suffix::FromField {
            stem: "_mrconvert.",
            field: "extension",
            default: "mif",
        },
    }),
    companions: &[],
    unreliable_exit_status: false,
};

pub const DWI2TENSOR: MrtrixTool = MrtrixTool {
    name: "dwi2tensor",
    binary: "dwi2tensor",
    summary: "Convert diffusion-weighted images to tensor images",
    fields: &[
        FieldSpec::new("in_file", FieldKind::FileList)
            .arg("%s")
            .at(-2)
            .required()
            .exists()
            .desc("Diffusion-weighted images"),
        output_file("out_filename", "%s", "Output tensor filename"),
        FieldSpec::new("in_mask_file", FieldKind::File)
            .arg("-mask %s")
            .at(-3)
            .exists()
            .desc("Input DWI mask"),
        FieldSpec::new("encoding_file", FieldKind::File)
            .arg("-grad %s")
            .at(2)
            .desc("Gradient encoding as a 4xN text file of [ X Y Z b ] rows."),
        FieldSpec::new("ignore_slice_by_volume", FieldKind::IntList)
            .arg("-ignoreslices %s")
            .at(2)
            .bounds(2, Some(2))
            .desc("[Slice Volume] pair to ignore when computing the tensor."),
        FieldSpec::new("ignore_volumes", FieldKind::IntList)
            .arg("-ignorevolumes %s")
            .at(2)
            .bounds(1, None)
            .desc("Volumes to ignore when computing the tensor."),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("tensor", "path/name of output diffusion tensor image")],
    primary: suffixed("tensor", &["in_file"], "out_filename", "_tensor.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const TENSOR2VECTOR: MrtrixTool = MrtrixTool {
    name: "tensor2vector",
    binary: "tensor2metric",
    summary: "Major eigenvector of a diffusion tensor image",
    fields: &[
        input_file(-2, "Diffusion tensor image"),
        output_file("out_filename", "-vector %s", "Output vector filename"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new(
        "vector",
        "the output image of the major eigenvectors of the diffusion tensor image.",
    )],
    primary: suffixed("vector", &["in_file"], "out_filename", "_vector.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const TENSOR2FA: MrtrixTool = MrtrixTool {
    name: "tensor2fa",
    binary: "tensor2metric",
    summary: "Fractional anisotropy of a diffusion tensor image",
    fields: &[
        input_file(-2, "Diffusion tensor image"),
        FieldSpec::new("in_mask_file", FieldKind::File)
            .arg("-mask %s")
            .at(-3)
            .exists()
            .desc("Diffusion mask"),
        output_file("out_filename", "-fa %s", "Output Fractional Anisotropy filename"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("FA", "Fractional anisotropy map")],
    primary: suffixed("FA", &["in_file"], "out_filename", "_FA.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const TENSOR2ADC: MrtrixTool = MrtrixTool {
    name: "tensor2adc",
    binary: "tensor2ADC",
    summary: "Apparent diffusion coefficient of a diffusion tensor image",
    fields: &[
        input_file(-2, "Diffusion tensor image"),
        output_file("out_filename", "%s", "Output ADC filename"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("ADC", "Apparent diffusion coefficient map")],
    primary: suffixed("ADC", &["in_file"], "out_filename", "_ADC.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const MR_MULTIPLY: MrtrixTool = MrtrixTool {
    name: "mrmultiply",
    binary: "mrcalc",
    summary: "Multiply two images",
    fields: &[
        input_files(-2, "Input images to be multiplied"),
        output_file("out_filename", "-mult %s", "Output image filename"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("out_file", "the output image of the multiplication")],
    primary: suffixed("out_file", &["in_files"], "out_filename", "_MRMult.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const MRTRIX_VIEWER: MrtrixTool = MrtrixTool {
    name: "mrview",
    binary: "mrview",
    summary: "Load images in the MRtrix viewer",
    fields: &[
        input_files(-2, "Input images to be viewed"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[],
    primary: None,
    companions: &[],
    unreliable_exit_status: false,
};

pub const MRTRIX_INFO: MrtrixTool = MrtrixTool {
    name: "mrinfo",
    binary: "mrinfo",
    summary: "Print image header information",
    fields: &[input_file(-2, "Input images to be read"), EXTRA_ARGS],
    outputs: &[],
    primary: None,
    companions: &[],
    unreliable_exit_status: false,
};

pub const GENERATE_WHITE_MATTER_MASK: MrtrixTool = MrtrixTool {
    name: "gen_wm_mask",
    binary: "gen_WM_mask",
    summary: "White matter probability mask from DWI",
    fields: &[
        input_file(-3, "Diffusion-weighted images"),
        FieldSpec::new("binary_mask", FieldKind::File)
            .arg("%s")
            .at(-2)
            .required()
            .exists()
            .desc("Binary brain mask"),
        output_file(
            "out_wm_prob_filename",
            "%s",
            "Output WM probability image filename",
        ),
        FieldSpec::new("encoding_file", FieldKind::File)
            .arg("-grad %s")
            .at(1)
            .required()
            .exists()
            .desc("Gradient encoding as a 4xN text file of [ X Y Z b ] rows."),
        FieldSpec::new("noise_level_margin", FieldKind::Float)
            .arg("-margin %s")
            .desc("Width of the margin used to estimate the noise level (default = 10)"),
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("WMprobabilitymap", "WMprobabilitymap")],
    primary: suffixed(
        "WMprobabilitymap",
        &["in_file"],
        "out_wm_prob_filename",
        "_WMProb.mif",
    ),
    companions: &[],
    unreliable_exit_status: false,
};

pub const ERODE: MrtrixTool = MrtrixTool {
    name: "erode",
    binary: "maskfilter",
    summary: "Erode (or dilate) a binary mask",
    fields: &[
        input_file(-3, "Input mask image to be eroded"),
        FieldSpec::new(
            "filtertype",
            FieldKind::Choice(&["clean", "connect", "dilate", "erode", "median"]),
        )
        .arg("%s")
        .at(-2)
        .desc("the type of filter to be applied (clean, connect, dilate, erode, median)"),
        output_file("out_filename", "%s", "Output image filename"),
        FieldSpec::new("number_of_passes", FieldKind::Int)
            .arg("-npass %s")
            .desc("the number of passes (default: 1)"),
        FieldSpec::new("dilate", FieldKind::Flag)
            .arg("-dilate")
            .at(1)
            .desc("Perform dilation rather than erosion"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("out_file", "the output image")],
    primary: suffixed("out_file", &["in_file"], "out_filename", "_erode.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const THRESHOLD: MrtrixTool = MrtrixTool {
    name: "threshold",
    binary: "threshold",
    summary: "Binary mask from an intensity threshold",
    fields: &[
        input_file(-2, "The input image to be thresholded"),
        output_file("out_filename", "%s", "The output binary image mask."),
        FieldSpec::new("absolute_threshold_value", FieldKind::Float)
            .arg("-abs %s")
            .desc("Specify threshold value as absolute intensity."),
        FieldSpec::new("percentage_threshold_value", FieldKind::Float)
            .arg("-percent %s")
            .desc("Specify threshold value as a percentage of the peak intensity in the input image."),
        FieldSpec::new("invert", FieldKind::Flag)
            .arg("-invert")
            .at(1)
            .desc("Invert output binary mask"),
        FieldSpec::new("replace_zeros_with_nan", FieldKind::Flag)
            .arg("-nan")
            .at(1)
            .desc("Replace all zero values with NaN"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("out_file", "The output binary image mask.")],
    primary: suffixed("out_file", &["in_file"], "out_filename", "_thresh.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const MEDIAN_FILTER_3D: MrtrixTool = MrtrixTool {
    name: "median3d",
    binary: "median3D",
    summary: "3x3x3 median filter",
    fields: &[
        input_file(-2, "Input images to be smoothed"),
        output_file("out_filename", "%s", "Output image filename"),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("out_file", "the output image")],
    primary: suffixed("out_file", &["in_file"], "out_filename", "_median3D.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

pub const MR_TRANSFORM: MrtrixTool = MrtrixTool {
    name: "mrtransform",
    binary: "mrtransform",
    summary: "Apply spatial transformations or reslice images",
    fields: &[
        input_files(-2, "Input images to be transformed"),
        output_file("out_filename", "%s", "Output image"),
        FieldSpec::new("invert", FieldKind::Flag)
            .arg("-inverse")
            .at(1)
            .desc("Invert the specified transform before using it"),
        FieldSpec::new("replace_transform", FieldKind::Flag)
            .arg("-replace")
            .at(1)
            .desc("Replace the current transform instead of applying to it"),
        FieldSpec::new("transformation_file", FieldKind::File)
            .arg("-transform %s")
            .at(1)
            .exists()
            .desc("The transform to apply, in the form of a 4x4 ascii file."),
        FieldSpec::new("template_image", FieldKind::File)
            .arg("-template %s")
            .at(1)
            .exists()
            .desc("Reslice the input image to match the specified template image."),
        FieldSpec::new("reference_image", FieldKind::File)
            .arg("-reference %s")
            .at(1)
            .exists()
            .desc("Reference image the transform maps onto; implies -replace."),
        FieldSpec::new("flip_x", FieldKind::Flag)
            .arg("-flipx")
            .at(1)
            .desc("Transform assumes an x-axis reversed relative to MRtrix (FSL FLIRT)."),
        FieldSpec::new("interp", FieldKind::Choice(&["nearest", "linear", "cubic", "sinc"]))
            .arg("-interp %s")
            .desc("Interpolation method used when reslicing (default: cubic)."),
        QUIET,
        DEBUG,
        EXTRA_ARGS,
    ],
    outputs: &[OutputField::new("out_file", "the output image of the transformation")],
    primary: suffixed("out_file", &["in_files"], "out_filename", "_MRTransform.mif"),
    companions: &[],
    unreliable_exit_status: false,
};

/// Every MRtrix tool, in listing order.
pub const TOOLS: &[&MrtrixTool] = &[
    &DWI_DENOISE,
    &DWI_BIAS_CORRECT,
    &MR_CONVERT,
    &DWI2TENSOR,
    &TENSOR2VECTOR,
    &TENSOR2FA,
    &TENSOR2ADC,
    &MR_MULTIPLY,
    &MRTRIX_VIEWER,
    &MRTRIX_INFO,
    &GENERATE_WHITE_MATTER_MASK,
    &ERODE,
    &THRESHOLD,
    &MEDIAN_FILTER_3D,
    &MR_TRANSFORM,
];

pub fn find_tool(name: &str) -> Option<&'static MrtrixTool> {
    TOOLS.iter().copied().find(|t| t.name == name)
}

/// One invocation of an MRtrix tool.
#[derive(Debug, Clone)]
pub struct MrtrixCommand {
    tool: &'static MrtrixTool,
    inputs: InputRecord,
}

impl MrtrixCommand {
    pub fn new(tool: &'static MrtrixTool, inputs: InputRecord) -> Self {
        Self { tool, inputs }
    }

    /// The derived name `<cwd>/<source base><suffix>`, ignoring any override.
    fn derived_output(&self, primary: &PrimaryOutput, ctx: &RunContext) -> Option<PathBuf> {
        let source = primary
            .sources
            .iter()
            .find_map(|field| self.inputs.get(field))?
            .texts()
            .first()
            .map(|s| s.to_string())?;

        let suffix = match primary.suffix {
            Suffix::Fixed(s) => s.to_string(),
            Suffix::FromField {
                stem,
                field,
                default,
            } => format!("{}{}", stem, self.inputs.text(field).unwrap_or(default)),
        };
        Some(fname_presuffix(source, "", &suffix, Some(&ctx.cwd), false))
    }

    /// Path of the main output: the override when given, else the derived name.
    pub fn primary_output(&self, ctx: &RunContext) -> Option<PathBuf> {
        let primary = self.tool.primary.as_ref()?;
        match self.inputs.text(primary.override_field) {
            Some(explicit) => Some(absolute(&ctx.cwd, explicit)),
            None => self.derived_output(primary, ctx),
        }
    }
}

impl CommandLine for MrtrixCommand {
    fn name(&self) -> &'static str {
        self.tool.name
    }

    fn default_binary(&self) -> &'static str {
        self.tool.binary
    }

    fn fields(&self) -> &'static [FieldSpec] {
        self.tool.fields
    }

    fn output_fields(&self) -> &'static [OutputField] {
        self.tool.outputs
    }

    fn inputs(&self) -> &InputRecord {
        &self.inputs
    }

    fn generated_value(&self, field: &FieldSpec, ctx: &RunContext) -> Option<Value> {
        let primary = self.tool.primary.as_ref()?;
        if field.name != primary.override_field {
            return None;
        }
        self.derived_output(primary, ctx).map(Value::from)
    }

    fn exit_status_reliable(&self) -> bool {
        !self.tool.unreliable_exit_status
    }

    fn list_outputs(&self, ctx: &RunContext, _output: &CommandOutput) -> Result<OutputRecord> {
        let mut outputs = OutputRecord::new();
        if let (Some(primary), Some(path)) = (self.tool.primary.as_ref(), self.primary_output(ctx)) {
            outputs.insert_path(primary.slot, path);
        }
        for companion in self.tool.companions {
            if let Some(path) = self.inputs.text(companion.field) {
                outputs.insert_path(companion.slot, absolute(&ctx.cwd, path));
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{arguments, run};
    use crate::error::AdapterError;
    use std::fs;

    fn scratch(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            fs::write(dir.path().join(f), b"").unwrap();
        }
        dir
    }

    #[test]
    fn test_tool_names_are_unique() {
        for (i, a) in TOOLS.iter().enumerate() {
            for b in &TOOLS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
        assert!(find_tool("dwi2tensor").is_some());
        assert!(find_tool("dwi2fod").is_none());
    }

    #[test]
    fn test_dwi2tensor_derives_output_name() {
        let dir = scratch(&["dwi.mif", "mask.mif"]);
        let cmd = MrtrixCommand::new(
            &DWI2TENSOR,
            InputRecord::new()
                .with("in_file", vec!["dwi.mif"])
                .with("in_mask_file", "mask.mif")
                .with("encoding_file", "encoding.txt")
                .with("quiet", true),
        );
        let ctx = RunContext::new(dir.path());
        let out = dir.path().join("dwi_tensor.mif");
        let args = arguments(&cmd, &ctx).unwrap();
        assert_eq!(
            args,
            vec![
                "-quiet",
                "-grad",
                "encoding.txt",
                "-mask",
                "mask.mif",
                "dwi.mif",
                out.to_str().unwrap()
            ]
        );

        let outputs = cmd.list_outputs(&ctx, &CommandOutput::default()).unwrap();
        assert_eq!(outputs.paths("tensor"), vec![out.as_path()]);
    }

    #[test]
    fn test_explicit_output_name_wins() {
        let dir = scratch(&["tensor.mif"]);
        let cmd = MrtrixCommand::new(
            &TENSOR2FA,
            InputRecord::new()
                .with("in_file", "tensor.mif")
                .with("out_filename", "fa.nii"),
        );
        let ctx = RunContext::new(dir.path());
        assert_eq!(
            arguments(&cmd, &ctx).unwrap(),
            vec!["tensor.mif", "-fa", "fa.nii"]
        );
        assert_eq!(cmd.primary_output(&ctx), Some(dir.path().join("fa.nii")));
    }

    #[test]
    fn test_mrconvert_extension_and_exclusive_sources() {
        let dir = scratch(&["dwi_FA.mif"]);
        fs::create_dir(dir.path().join("dicom")).unwrap();
        let ctx = RunContext::new(dir.path());

        let cmd = MrtrixCommand::new(
            &MR_CONVERT,
            InputRecord::new()
                .with("in_file", "dwi_FA.mif")
                .with("extension", "nii")
                .with("voxel_dims", vec![1.0, 1.0, 2.5])
                .with("resample", 2.9),
        );
        assert_eq!(
            cmd.primary_output(&ctx),
            Some(dir.path().join("dwi_FA_mrconvert.nii"))
        );
        let args = arguments(&cmd, &ctx).unwrap();
        assert_eq!(&args[..4], &["-vox", "1.0,1.0,2.5", "-scale", "2"]);

        let from_dir = MrtrixCommand::new(&MR_CONVERT, InputRecord::new().with("in_dir", "dicom"));
        assert_eq!(
            from_dir.primary_output(&ctx),
            Some(dir.path().join("dicom_mrconvert.mif"))
        );

        let both = MrtrixCommand::new(
            &MR_CONVERT,
            InputRecord::new()
                .with("in_dir", "dicom")
                .with("in_file", "dwi_FA.mif"),
        );
        assert!(matches!(
            arguments(&both, &ctx),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_bias_correct_estimators_are_exclusive() {
        let dir = scratch(&["dwi.mif"]);
        let cmd = MrtrixCommand::new(
            &DWI_BIAS_CORRECT,
            InputRecord::new()
                .with("in_file", "dwi.mif")
                .with("use_ants", true)
                .with("use_fsl", true),
        );
        assert!(arguments(&cmd, &RunContext::new(dir.path())).is_err());
    }

    #[test]
    fn test_denoise_reports_noise_map_when_requested() {
        let dir = scratch(&["dwi.nii.gz"]);
        let cmd = MrtrixCommand::new(
            &DWI_DENOISE,
            InputRecord::new()
                .with("in_file", "dwi.nii.gz")
                .with("out_noisemap", "noise.mif")
                .with("extent_window", vec![5.0, 5.0, 5.0]),
        );
        let ctx = RunContext::new(dir.path());
        let outputs = cmd.list_outputs(&ctx, &CommandOutput::default()).unwrap();
        assert_eq!(
            outputs.paths("out_file"),
            vec![dir.path().join("dwi_denoised.mif").as_path()]
        );
        assert_eq!(
            outputs.paths("out_noisemap"),
            vec![dir.path().join("noise.mif").as_path()]
        );
        assert!(!cmd.exit_status_reliable());
    }

    #[test]
    fn test_viewer_has_no_outputs() {
        let dir = scratch(&["a.mif", "b.mif"]);
        let cmd = MrtrixCommand::new(
            &MRTRIX_VIEWER,
            InputRecord::new().with("in_files", vec!["a.mif", "b.mif"]),
        );
        let ctx = RunContext::new(dir.path());
        assert_eq!(arguments(&cmd, &ctx).unwrap(), vec!["a.mif", "b.mif"]);
        assert!(cmd
            .list_outputs(&ctx, &CommandOutput::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_erode_orders_filter_before_output() {
        let dir = scratch(&["mask.mif"]);
        let cmd = MrtrixCommand::new(
            &ERODE,
            InputRecord::new()
                .with("in_file", "mask.mif")
                .with("filtertype", "erode")
                .with("number_of_passes", 2i64)
                .with("out_filename", "eroded.mif"),
        );
        assert_eq!(
            arguments(&cmd, &RunContext::new(dir.path())).unwrap(),
            vec!["-npass", "2", "mask.mif", "erode", "eroded.mif"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_missing_tensor() {
        let dir = scratch(&["dwi.mif"]);
        let cmd = MrtrixCommand::new(&DWI2TENSOR, InputRecord::new().with("in_file", "dwi.mif"));
        let ctx = RunContext::new(dir.path()).with_binary("true");

        let err = run(&cmd, &ctx).await.unwrap_err();
        assert!(matches!(err, AdapterError::OutputNotFound { ref slot, .. } if slot == "tensor"));

        fs::write(dir.path().join("dwi_tensor.mif"), b"").unwrap();
        let result = run(&cmd, &ctx).await.unwrap();
        let tensor = dir.path().join("dwi_tensor.mif");
        assert_eq!(result.outputs.paths("tensor"), vec![tensor.as_path()]);
    }
}
