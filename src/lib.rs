//! Typed adapters around neuroimaging command-line tools.
//!
//! Each adapter declares its inputs and outputs, turns an [`InputRecord`]
//! into one subprocess invocation, and reports the files the tool wrote:
//! dcm2nii / dcm2niix conversion (outputs scraped from stdout), the MRtrix
//! preprocessing tools, and the cmtk parcellation driver.

pub mod command;
pub mod config;
pub mod converter;
pub mod error;
pub mod filemanip;
pub mod mrtrix;
pub mod parcellation;
pub mod processor;
pub mod schema;
pub mod scraper;

use command::{CommandLine, OutputField};
use converter::{Dcm2nii, Dcm2niix, DCM2NIIX_FIELDS, DCM2NIIX_OUTPUTS, DCM2NII_FIELDS, DCM2NII_OUTPUTS};
use mrtrix::{find_tool, MrtrixCommand, TOOLS};
use schema::{FieldSpec, InputRecord};

/// Static description of a registered adapter.
#[derive(Debug, Clone, Copy)]
pub struct AdapterInfo {
    pub name: &'static str,
    pub binary: &'static str,
    pub summary: &'static str,
    pub fields: &'static [FieldSpec],
    pub outputs: &'static [OutputField],
}

const DCM2NII_INFO: AdapterInfo = AdapterInfo {
    name: "dcm2nii",
    binary: "dcm2nii",
    summary: "Convert DICOM series to NIfTI (legacy converter)",
    fields: DCM2NII_FIELDS,
    outputs: DCM2NII_OUTPUTS,
};

const DCM2NIIX_INFO: AdapterInfo = AdapterInfo {
    name: "dcm2niix",
    binary: "dcm2niix",
    summary: "Convert DICOM series to NIfTI with BIDS sidecars",
    fields: DCM2NIIX_FIELDS,
    outputs: DCM2NIIX_OUTPUTS,
};

/// Every command-line adapter, converters first.
pub fn adapters() -> Vec<AdapterInfo> {
    let mut all = vec![DCM2NII_INFO, DCM2NIIX_INFO];
    all.extend(TOOLS.iter().map(|t| AdapterInfo {
        name: t.name,
        binary: t.binary,
        summary: t.summary,
        fields: t.fields,
        outputs: t.outputs,
    }));
    all
}

pub fn adapter_info(name: &str) -> Option<AdapterInfo> {
    adapters().into_iter().find(|a| a.name == name)
}

/// Instantiate the adapter called `name` with `inputs`.
pub fn build_adapter(name: &str, inputs: InputRecord) -> Option<Box<dyn CommandLine>> {
    match name {
        "dcm2nii" => Some(Box::new(Dcm2nii::new(inputs))),
        "dcm2niix" => Some(Box::new(Dcm2niix::new(inputs))),
        other => find_tool(other).map(|tool| {
            Box::new(MrtrixCommand::new(tool, inputs)) as Box<dyn CommandLine>
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_builds_every_listed_adapter() {
        for info in adapters() {
            let adapter = build_adapter(info.name, InputRecord::new()).unwrap();
            assert_eq!(adapter.name(), info.name);
            assert_eq!(adapter.default_binary(), info.binary);
        }
        assert_eq!(adapters().len(), 17);
        assert!(build_adapter("bet", InputRecord::new()).is_none());
    }

    #[test]
    fn test_every_adapter_accepts_extra_args() {
        for info in adapters() {
            assert!(
                info.fields.iter().any(|f| f.name == "args"),
                "{} lacks args",
                info.name
            );
        }
    }
}
