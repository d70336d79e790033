//! Recover converted file paths from dcm2nii / dcm2niix stdout.
//!
//! Neither converter reports its outputs in a structured form, so each run's
//! stdout is scanned line by line. A scraper is a small state machine: every
//! call to [`LineScraper::feed`] consumes one line and yields zero or more
//! [`ScrapedFile`] events. Parsing never fails; unrecognised output just
//! yields nothing.

use crate::filemanip::{absolute, fname_presuffix, split_filename};
use regex::Regex;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// One output path recovered from a line of stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapedFile {
    Converted(PathBuf),
    Reoriented(PathBuf),
    ReorientedAndCropped(PathBuf),
    Bvec(PathBuf),
    Bval(PathBuf),
    BidsSidecar(PathBuf),
}

/// All paths recovered from one run, in the order they were reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConvertedFiles {
    pub converted: Vec<PathBuf>,
    pub reoriented: Vec<PathBuf>,
    pub reoriented_and_cropped: Vec<PathBuf>,
    pub bvecs: Vec<PathBuf>,
    pub bvals: Vec<PathBuf>,
    pub bids: Vec<PathBuf>,
}

impl ConvertedFiles {
    pub fn push(&mut self, file: ScrapedFile) {
        match file {
            ScrapedFile::Converted(p) => self.converted.push(p),
            ScrapedFile::Reoriented(p) => self.reoriented.push(p),
            ScrapedFile::ReorientedAndCropped(p) => self.reoriented_and_cropped.push(p),
            ScrapedFile::Bvec(p) => self.bvecs.push(p),
            ScrapedFile::Bval(p) => self.bvals.push(p),
            ScrapedFile::BidsSidecar(p) => self.bids.push(p),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.converted.is_empty()
            && self.reoriented.is_empty()
            && self.reoriented_and_cropped.is_empty()
            && self.bvecs.is_empty()
            && self.bvals.is_empty()
            && self.bids.is_empty()
    }
}

/// A line-at-a-time stdout state machine.
pub trait LineScraper {
    fn feed(&mut self, line: &str) -> Vec<ScrapedFile>;
}

/// Run `scraper` over every line of `stdout` and collect the results.
pub fn scrape<S: LineScraper>(mut scraper: S, stdout: &str) -> ConvertedFiles {
    let mut files = ConvertedFiles::default();
    for line in stdout.lines() {
        for file in scraper.feed(line) {
            files.push(file);
        }
    }
    files
}

fn arrow_pattern() -> &'static Regex {
    static ARROW: OnceLock<Regex> = OnceLock::new();
    ARROW.get_or_init(|| Regex::new(r".*--> (.*)").expect("arrow pattern is valid"))
}

fn fragment_pattern() -> &'static Regex {
    static FRAGMENT: OnceLock<Regex> = OnceLock::new();
    FRAGMENT.get_or_init(|| Regex::new(r"\S+/\S+").expect("fragment pattern is valid"))
}

/// Append `suffix` to the full path without touching its extension.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

fn non_empty(path: PathBuf) -> Option<PathBuf> {
    (!path.as_os_str().is_empty()).then_some(path)
}

const SAVING: &str = "Saving ";
const GZIP: &str = "GZip...";
const DIFFUSION_DIRECTIONS: &str = "Number of diffusion directions ";
const REORIENTING: &str = "Reorienting as ";
const CROPPING: &str = "Cropping NIfTI/Analyze image ";

/// Scraper for the classic `dcm2nii` converter.
///
/// Carries the last converted file (gradient tables share its base name) and
/// a skip flag: reorient and crop announcements are followed by a decoration
/// line that must not be classified.
#[derive(Debug, Clone)]
pub struct Dcm2niiScraper {
    output_dir: PathBuf,
    last_added_file: Option<PathBuf>,
    skip_next: bool,
}

impl Dcm2niiScraper {
    /// `output_dir` resolves the relative names printed after `GZip...`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            last_added_file: None,
            skip_next: false,
        }
    }

    pub fn last_added_file(&self) -> Option<&Path> {
        self.last_added_file.as_deref()
    }

    pub fn skip_next(&self) -> bool {
        self.skip_next
    }

    fn classify_converted(&self, line: &str, events: &mut Vec<ScrapedFile>) -> Option<PathBuf> {
        if let Some(rest) = line.strip_prefix(SAVING) {
            return non_empty(PathBuf::from(rest));
        }
        if let Some(rest) = line.strip_prefix(GZIP) {
            return non_empty(absolute(&self.output_dir, rest));
        }
        if line.starts_with(DIFFUSION_DIRECTIONS) {
            if let Some(last) = &self.last_added_file {
                let split = split_filename(last);
                events.push(ScrapedFile::Bvec(
                    split.dir.join(format!("{}.bvec", split.base)),
                ));
                events.push(ScrapedFile::Bval(
                    split.dir.join(format!("{}.bval", split.base)),
                ));
            }
            return None;
        }
        if line.contains("-->") {
            return arrow_pattern()
                .captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| non_empty(PathBuf::from(m.as_str())));
        }
        None
    }
}

impl LineScraper for Dcm2niiScraper {
    fn feed(&mut self, line: &str) -> Vec<ScrapedFile> {
        if self.skip_next {
            self.skip_next = false;
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(file) = self.classify_converted(line, &mut events) {
            self.last_added_file = Some(file.clone());
            events.push(ScrapedFile::Converted(file));
            return events;
        }

        if let Some(rest) = line.strip_prefix(REORIENTING) {
            if let Some(path) = non_empty(PathBuf::from(rest)) {
                events.push(ScrapedFile::Reoriented(path));
            }
            self.skip_next = true;
        } else if let Some(rest) = line.strip_prefix(CROPPING) {
            let cropped = fname_presuffix(rest, "c", "", None, true);
            events.push(ScrapedFile::ReorientedAndCropped(cropped));
            self.skip_next = true;
        }
        events
    }
}

/// Image compression mode of `dcm2niix` (`-z`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Compression {
    /// `y`: external pigz.
    Pigz,
    /// `i`: built-in gzip.
    #[default]
    Internal,
    /// `n`: uncompressed `.nii`.
    Disabled,
}

impl Compression {
    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "y" => Some(Compression::Pigz),
            "i" => Some(Compression::Internal),
            "n" => Some(Compression::Disabled),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Disabled => ".nii",
            _ => ".nii.gz",
        }
    }
}

/// Scraper for `dcm2niix`.
///
/// Each `Convert` line names an output stem; the image extension follows the
/// compression mode. A `DTI gradients` line marks the next converted stem
/// as having `.bvec`/`.bval` companions.
#[derive(Debug, Clone)]
pub struct Dcm2niixScraper {
    output_dir: PathBuf,
    compression: Compression,
    bids_sidecar: bool,
    pending_gradients: bool,
}

impl Dcm2niixScraper {
    pub fn new(output_dir: impl Into<PathBuf>, compression: Compression, bids_sidecar: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            compression,
            bids_sidecar,
            pending_gradients: false,
        }
    }
}

impl LineScraper for Dcm2niixScraper {
    fn feed(&mut self, line: &str) -> Vec<ScrapedFile> {
        let mut events = Vec::new();

        if line.starts_with("Convert ") {
            // A Convert line without a path fragment reports nothing.
            let Some(fragment) = fragment_pattern().find(line) else {
                return events;
            };
            let stem = absolute(&self.output_dir, fragment.as_str());

            if self.pending_gradients {
                events.push(ScrapedFile::Bvec(with_suffix(&stem, ".bvec")));
                events.push(ScrapedFile::Bval(with_suffix(&stem, ".bval")));
                self.pending_gradients = false;
            }
            events.push(ScrapedFile::Converted(with_suffix(
                &stem,
                self.compression.extension(),
            )));
            if self.bids_sidecar {
                events.push(ScrapedFile::BidsSidecar(with_suffix(&stem, ".json")));
            }
        } else if line.contains("DTI gradients") || line.contains("DTI gradient directions") {
            self.pending_gradients = true;
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dcm2nii(stdout: &str) -> ConvertedFiles {
        scrape(Dcm2niiScraper::new("/tmp/out"), stdout)
    }

    fn paths(items: &[&str]) -> Vec<PathBuf> {
        items.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_unrecognised_output_yields_nothing() {
        let text = "Chris Rorden's dcm2nii :: 4AUGUST2014\nreading preferences\n\nDone\n";
        assert!(dcm2nii(text).is_empty());
        assert!(dcm2nii("").is_empty());

        let niix = scrape(
            Dcm2niixScraper::new("/data/out", Compression::Internal, true),
            "Compression will be faster with 'pigz' installed\nConversion required 0.5 seconds\n",
        );
        assert!(niix.is_empty());
    }

    #[test]
    fn test_saving_then_diffusion_directions_derives_gradients() {
        let files = dcm2nii("Saving /tmp/out/img.nii\nNumber of diffusion directions 32\n");
        assert_eq!(files.converted, paths(&["/tmp/out/img.nii"]));
        assert_eq!(files.bvecs, paths(&["/tmp/out/img.bvec"]));
        assert_eq!(files.bvals, paths(&["/tmp/out/img.bval"]));
    }

    #[test]
    fn test_diffusion_directions_strip_compound_extension() {
        let files = dcm2nii("GZip...img.nii.gz\nNumber of diffusion directions 64\n");
        assert_eq!(files.converted, paths(&["/tmp/out/img.nii.gz"]));
        assert_eq!(files.bvecs, paths(&["/tmp/out/img.bvec"]));
        assert_eq!(files.bvals, paths(&["/tmp/out/img.bval"]));
    }

    #[test]
    fn test_diffusion_directions_without_prior_file_ignored() {
        let files = dcm2nii("Number of diffusion directions 32\n");
        assert!(files.is_empty());
    }

    #[test]
    fn test_reorient_skips_continuation_line() {
        let files = dcm2nii("Reorienting as /tmp/out/img_reo\nSaving /tmp/out/other.nii\n");
        assert_eq!(files.reoriented, paths(&["/tmp/out/img_reo"]));
        assert!(files.converted.is_empty());
        assert!(files.bvecs.is_empty());
    }

    #[test]
    fn test_skip_flag_cleared_after_one_line() {
        let mut scraper = Dcm2niiScraper::new("/tmp/out");
        assert_eq!(
            scraper.feed("Reorienting as /tmp/out/img_reo"),
            vec![ScrapedFile::Reoriented(PathBuf::from("/tmp/out/img_reo"))]
        );
        assert!(scraper.skip_next());
        // A continuation that looks like another reorient is still discarded.
        assert!(scraper.feed("Reorienting as /tmp/out/x").is_empty());
        assert!(!scraper.skip_next());
        assert_eq!(
            scraper.feed("Saving /tmp/out/next.nii"),
            vec![ScrapedFile::Converted(PathBuf::from("/tmp/out/next.nii"))]
        );
    }

    #[test]
    fn test_cropping_prefixes_basename() {
        let files = dcm2nii(
            "Cropping NIfTI/Analyze image /tmp/out/o20140101.nii\n 192x256x256 -> 170x200x190\n",
        );
        assert_eq!(files.reoriented_and_cropped, paths(&["/tmp/out/co20140101.nii"]));
        assert!(files.converted.is_empty());
    }

    #[test]
    fn test_arrow_marks_converted_file() {
        let mut scraper = Dcm2niiScraper::new("/tmp/out");
        let events = scraper.feed("/tmp/in/IM0001.dcm--> /tmp/out/20140101_T1.nii");
        assert_eq!(
            events,
            vec![ScrapedFile::Converted(PathBuf::from("/tmp/out/20140101_T1.nii"))]
        );
        assert_eq!(
            scraper.last_added_file(),
            Some(Path::new("/tmp/out/20140101_T1.nii"))
        );
        // Arrow without the trailing space names no file.
        assert!(scraper.feed("a-->b").is_empty());
    }

    #[test]
    fn test_niix_uncompressed_extension() {
        let files = scrape(
            Dcm2niixScraper::new("/data/out", Compression::Disabled, false),
            "Convert SUBJ/img\n",
        );
        assert_eq!(files.converted, paths(&["/data/out/SUBJ/img.nii"]));
        assert!(files.bids.is_empty());
    }

    #[test]
    fn test_niix_gradients_and_sidecar() {
        let text = "Found 65 DICOM image(s)\n\
                    Using 65 DTI gradient directions\n\
                    Convert SUBJ/dwi\n\
                    Convert SUBJ/t1\n";
        let files = scrape(
            Dcm2niixScraper::new("/data/out", Compression::Internal, true),
            text,
        );
        assert_eq!(
            files.converted,
            paths(&["/data/out/SUBJ/dwi.nii.gz", "/data/out/SUBJ/t1.nii.gz"])
        );
        assert_eq!(files.bvecs, paths(&["/data/out/SUBJ/dwi.bvec"]));
        assert_eq!(files.bvals, paths(&["/data/out/SUBJ/dwi.bval"]));
        assert_eq!(
            files.bids,
            paths(&["/data/out/SUBJ/dwi.json", "/data/out/SUBJ/t1.json"])
        );
    }

    #[test]
    fn test_niix_absolute_fragment_and_missing_fragment() {
        let mut scraper = Dcm2niixScraper::new("/data/out", Compression::Pigz, false);
        assert_eq!(
            scraper.feed("Convert 176 DICOM as /scratch/nii/T1_MPRAGE (256x256x176x1)"),
            vec![ScrapedFile::Converted(PathBuf::from(
                "/scratch/nii/T1_MPRAGE.nii.gz"
            ))]
        );
        assert!(scraper.feed("Convert nothing here").is_empty());
    }

    #[test]
    fn test_parsing_is_repeatable() {
        let text = "Saving /tmp/out/a.nii\nReorienting as /tmp/out/ra\n x\nNumber of diffusion directions 6\n";
        assert_eq!(dcm2nii(text), dcm2nii(text));
    }

    #[test]
    fn test_crop_continuation_is_never_classified() {
        let crop = "Cropping NIfTI/Analyze image /tmp/out/o20140101.nii
";
        let files = dcm2nii(&format!("{}Saving /tmp/out/next.nii
", crop));
        assert_eq!(files.reoriented_and_cropped, paths(&["/tmp/out/co20140101.nii"]));
        assert!(files.converted.is_empty());

        let files = dcm2nii(&format!("{}IM0001.dcm--> /tmp/out/next.nii
", crop));
        assert!(files.converted.is_empty());

        let cropped = dcm2nii("Cropping NIfTI/Analyze image img.nii.gz
 x
");
        assert_eq!(cropped.reoriented_and_cropped, paths(&["cimg.nii.gz"]));
    }

    #[test]
    fn test_arrow_file_names_gradient_tables() {
        let files = dcm2nii(
            "/tmp/in/IM0001.dcm--> /tmp/out/dwi.nii
Number of diffusion directions 30
",
        );
        assert_eq!(files.converted, paths(&["/tmp/out/dwi.nii"]));
        assert_eq!(files.bvecs, paths(&["/tmp/out/dwi.bvec"]));
        assert_eq!(files.bvals, paths(&["/tmp/out/dwi.bval"]));
    }

    #[test]
    fn test_niix_parsing_is_repeatable() {
        let scraper = Dcm2niixScraper::new("/data/out", Compression::Internal, false);
        // Ends with a gradient announcement that no Convert line consumes.
        let text = "Convert SUBJ/dwi
Using 30 DTI gradient directions
";
        let first = scrape(scraper.clone(), text);
        let second = scrape(scraper.clone(), text);
        assert_eq!(first, second);
        assert!(first.bvecs.is_empty());

        // The pending flag of an earlier parse does not leak into the next one.
        let next = scrape(scraper, "Convert SUBJ/t1
");
        assert_eq!(next.converted, paths(&["/data/out/SUBJ/t1.nii.gz"]));
        assert!(next.bvecs.is_empty());
        assert!(next.bvals.is_empty());
    }
}
