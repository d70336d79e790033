use crate::command::{command_line, run, CommandLine, OutputRecord, RunContext};
use crate::parcellation::{Parcellate, ParcellationBackend, SchemeRegistry};
use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

#[derive(Serialize, Default, Debug)]
pub struct RunReport {
    pub adapter: String,
    pub command_line: String,
    pub status: String,
    pub exit_code: Option<i32>,
    pub reason: Vec<String>,
    pub outputs: OutputRecord,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Run one adapter behind a spinner and fold the outcome into a report.
pub async fn process_adapter(adapter: &dyn CommandLine, ctx: &RunContext) -> RunReport {
    let pb = setup_progress_bar(adapter.name());
    let mut res = RunReport {
        adapter: adapter.name().to_string(),
        timestamp: Utc::now(),
        ..Default::default()
    };

    match command_line(adapter, ctx) {
        Ok(cmd) => {
            pb.set_message(cmd.clone());
            res.command_line = cmd;
        }
        Err(e) => return finish_with_error(pb, res, e.to_string()),
    }

    match run(adapter, ctx).await {
        Ok(result) => {
            res.exit_code = result.output.exit_code;
            res.elapsed_ms = result.output.elapsed_ms;
            if !adapter.exit_status_reliable() && !result.output.stderr.trim().is_empty() {
                res.reason
                    .push(format!("stderr: {}", result.output.stderr.trim()));
            }
            res.outputs = result.outputs;
        }
        Err(e) => {
            if let crate::error::AdapterError::Execution { code, .. } = &e {
                res.exit_code = *code;
            }
            return finish_with_error(pb, res, e.to_string());
        }
    }

    res.status = summarize_status(&res.outputs, &res.reason);
    finish(pb, &res);
    res
}

/// Run a parcellation behind a spinner and fold the outcome into a report.
pub async fn process_parcellation(
    parcellate: &Parcellate,
    backend: &dyn ParcellationBackend,
    registry: &dyn SchemeRegistry,
    cwd: &Path,
) -> RunReport {
    let pb = setup_progress_bar("parcellate");
    pb.set_message(format!("{} ({})", parcellate.subject_id, parcellate.scheme));
    let start = std::time::Instant::now();
    let mut res = RunReport {
        adapter: "parcellate".to_string(),
        command_line: format!(
            "parcellate {} {}",
            parcellate.scheme, parcellate.subject_id
        ),
        timestamp: Utc::now(),
        ..Default::default()
    };

    match parcellate.run(backend, registry, cwd).await {
        Ok(outputs) => res.outputs = outputs,
        Err(e) => return finish_with_error(pb, res, e.to_string()),
    }
    res.elapsed_ms = start.elapsed().as_millis() as u64;
    res.status = summarize_status(&res.outputs, &res.reason);
    finish(pb, &res);
    res
}

fn setup_progress_bar(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{prefix}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn finish(pb: ProgressBar, res: &RunReport) {
    let mark = match res.status.as_str() {
        "Success" => "✓".green(),
        _ => "!".yellow(),
    };
    pb.finish_with_message(format!("{} {} ({} ms)", mark, res.status, res.elapsed_ms));
}

fn finish_with_error(pb: ProgressBar, mut res: RunReport, err: String) -> RunReport {
    pb.finish_with_message(format!("{} {}", "✗".red(), err));
    res.status = "Failed".into();
    res.reason.push(err);
    res
}

/// `Success` without complaints, `Partial` when outputs exist despite them,
/// `Failed` otherwise.
pub fn summarize_status(outputs: &OutputRecord, reasons: &[String]) -> String {
    if reasons.is_empty() {
        "Success".into()
    } else if !outputs.is_empty() {
        "Partial".into()
    } else {
        "Failed".into()
    }
}

/// Write whichever report paths are configured.
pub fn write_reports(
    csv_path: Option<&Path>,
    json_path: Option<&Path>,
    results: &[RunReport],
) -> Result<()> {
    if let Some(path) = csv_path {
        write_csv_report(path, results)?;
    }
    if let Some(path) = json_path {
        write_json_report(path, results)?;
    }
    Ok(())
}

fn write_json_report(path: &Path, results: &[RunReport]) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, results)?;
    Ok(())
}

/// One row per output path; a run without outputs still gets one row.
fn write_csv_report(path: &Path, results: &[RunReport]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    wtr.write_record([
        "Adapter",
        "Status",
        "ExitCode",
        "Slot",
        "Path",
        "Reason",
        "Timestamp",
    ])?;
    for r in results {
        let exit_code = r.exit_code.map(|c| c.to_string()).unwrap_or_default();
        let reason = r.reason.join("; ");
        let timestamp = r.timestamp.to_rfc3339();
        let rows = r.outputs.rows();
        if rows.is_empty() {
            wtr.write_record([
                r.adapter.as_str(),
                r.status.as_str(),
                exit_code.as_str(),
                "",
                "",
                reason.as_str(),
                timestamp.as_str(),
            ])?;
        }
        for (slot, output) in rows {
            let output = output.to_string_lossy();
            wtr.write_record([
                r.adapter.as_str(),
                r.status.as_str(),
                exit_code.as_str(),
                slot,
                &*output,
                reason.as_str(),
                timestamp.as_str(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mrtrix::{MrtrixCommand, MRTRIX_INFO, THRESHOLD};
    use crate::schema::InputRecord;
    use std::fs;
    use std::path::PathBuf;

    fn report_with_outputs() -> RunReport {
        let mut outputs = OutputRecord::new();
        outputs.insert_paths(
            "bvecs",
            vec![PathBuf::from("/w/a.bvec"), PathBuf::from("/w/b.bvec")],
        );
        RunReport {
            adapter: "dcm2niix".into(),
            command_line: "dcm2niix -o /w in.dcm".into(),
            status: "Success".into(),
            exit_code: Some(0),
            outputs,
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_summarize_status() {
        let mut outputs = OutputRecord::new();
        assert_eq!(summarize_status(&outputs, &[]), "Success");
        assert_eq!(summarize_status(&outputs, &["boom".into()]), "Failed");
        outputs.insert_path("out_file", "/w/x.mif");
        assert_eq!(summarize_status(&outputs, &["stderr: x".into()]), "Partial");
    }

    #[test]
    fn test_write_reports() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("report.csv");
        let json_path = dir.path().join("report.json");
        let failed = RunReport {
            adapter: "mrinfo".into(),
            status: "Failed".into(),
            reason: vec!["Input `in_file` refers to a missing file".into()],
            ..Default::default()
        };

        write_reports(
            Some(&csv_path),
            Some(&json_path),
            &[report_with_outputs(), failed],
        )
        .unwrap();

        let csv = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Adapter,Status,ExitCode,Slot,Path"));
        assert!(lines[1].contains("bvecs,/w/a.bvec"));
        assert!(lines[3].starts_with("mrinfo,Failed,,,,"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(json[0]["outputs"]["bvecs"][1], "/w/b.bvec");
        assert_eq!(json[1]["status"], "Failed");
    }

    #[test]
    fn test_write_reports_skips_unset_paths() {
        write_reports(None, None, &[report_with_outputs()]).unwrap();
    }

    #[tokio::test]
    async fn test_invalid_inputs_fail_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = MrtrixCommand::new(&MRTRIX_INFO, InputRecord::new());
        let report = process_adapter(&cmd, &RunContext::new(dir.path())).await;
        assert_eq!(report.status, "Failed");
        assert!(report.command_line.is_empty());
        assert!(report.reason[0].contains("in_file"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_adapter_success() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("brain.mif"), b"").unwrap();
        fs::write(dir.path().join("brain_thresh.mif"), b"").unwrap();
        let cmd = MrtrixCommand::new(
            &THRESHOLD,
            InputRecord::new()
                .with("in_file", "brain.mif")
                .with("absolute_threshold_value", 0.5),
        );
        let ctx = RunContext::new(dir.path()).with_binary("true");

        let report = process_adapter(&cmd, &ctx).await;
        assert_eq!(report.status, "Success");
        assert_eq!(report.exit_code, Some(0));
        assert!(report.command_line.starts_with("true -abs 0.5 brain.mif"));
        assert_eq!(
            report.outputs.paths("out_file"),
            vec![dir.path().join("brain_thresh.mif").as_path()]
        );
    }
}
