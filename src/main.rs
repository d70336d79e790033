//! CLI around the neuroimaging tool adapters.
//!
//! Lists and describes adapters, prints or runs the command line built from
//! `--set name=value` inputs, drives cmtk parcellation, and replays saved
//! converter stdout through the output scrapers. Runs write CSV/JSON reports
//! when report paths are configured.
use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use neuro_adapters::command::{binary_available, command_line, RunContext};
use neuro_adapters::config::{
    load_runtime_config, sanitize_optional_string, EffectiveConfig, RuntimeConfigFile,
    DEFAULT_CONFIG_PATH,
};
use neuro_adapters::parcellation::{BuiltinSchemes, CmtkPythonBackend, Parcellate, Scheme};
use neuro_adapters::processor::{process_adapter, process_parcellation, write_reports, RunReport};
use neuro_adapters::schema::{find_field, parse_value, InputRecord};
use neuro_adapters::scraper::{scrape, Compression, ConvertedFiles, Dcm2niiScraper, Dcm2niixScraper};
use neuro_adapters::{adapter_info, adapters, build_adapter, AdapterInfo};

#[derive(Parser)]
#[command(name = "neuro_adapters")]
#[command(about = "Run dcm2nii(x), MRtrix and cmtk tools with typed inputs", long_about = None)]
/// Entry CLI that dispatches to subcommands.
struct Cli {
    /// Optional runtime config in TOML that supplies defaults for the CLI.
    #[arg(short, long, help = "TOML config file")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every adapter
    List,
    /// Show an adapter's inputs and outputs
    Describe { adapter: String },
    /// Print the command line an adapter would run
    Cmdline(InvokeArgs),
    /// Run an adapter and report its outputs
    Run(InvokeArgs),
    /// Run the cmtk parcellation for one subject
    Parcellate(ParcellateArgs),
    /// Replay saved converter stdout and print the files it names
    Scrape(ScrapeArgs),
}

#[derive(Args, Clone, Default)]
struct SharedArgs {
    /// Working directory of the tool; relative inputs resolve here.
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Optional destination for the CSV output report.
    #[arg(long)]
    report_csv: Option<PathBuf>,

    /// Optional destination for the JSON output report.
    #[arg(long)]
    report_json: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct InvokeArgs {
    /// Adapter name, see `list`.
    adapter: String,

    /// Input assignment `name=value`; lists are comma-separated.
    #[arg(short, long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Binary to launch instead of the adapter's default.
    #[arg(long)]
    binary: Option<String>,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Args, Clone)]
struct ParcellateArgs {
    #[arg(long)]
    subject_id: String,

    /// Freesurfer main directory.
    #[arg(long, value_name = "DIR")]
    subjects_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "lausanne2008")]
    scheme: SchemeArg,

    /// Python interpreter with cmtklib installed.
    #[arg(long)]
    python: Option<String>,

    #[command(flatten)]
    shared: SharedArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum SchemeArg {
    Lausanne2008,
    NativeFreesurfer,
}

impl From<SchemeArg> for Scheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::Lausanne2008 => Scheme::Lausanne2008,
            SchemeArg::NativeFreesurfer => Scheme::NativeFreesurfer,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Converter {
    Dcm2nii,
    Dcm2niix,
}

#[derive(Args, Clone)]
struct ScrapeArgs {
    #[arg(value_enum)]
    converter: Converter,

    /// File holding the converter's captured stdout.
    stdout: PathBuf,

    /// Directory the converter wrote into.
    #[arg(long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// dcm2niix compression flag: y, i or n.
    #[arg(long, default_value = "i")]
    compress: String,

    /// dcm2niix wrote BIDS sidecars.
    #[arg(long)]
    bids: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);
    let cfg_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Commands::List => {
            list_adapters();
            Ok(())
        }
        Commands::Describe { adapter } => describe_adapter(&adapter),
        Commands::Cmdline(cmd) => print_cmdline(cmd, &cfg_path),
        Commands::Run(cmd) => run_adapter(cmd, &cfg_path).await,
        Commands::Parcellate(cmd) => run_parcellate(cmd, &cfg_path).await,
        Commands::Scrape(cmd) => run_scrape(cmd),
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "neuro_adapters=info",
        1 => "neuro_adapters=debug",
        _ => "neuro_adapters=trace",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Merge CLI overrides with a parsed runtime config, falling back to crate defaults.
///
/// CLI flags take precedence, followed by the runtime file, and finally `EffectiveConfig::defaults()`.
fn merge_config(
    cli: &SharedArgs,
    python: Option<String>,
    file: Option<RuntimeConfigFile>,
) -> EffectiveConfig {
    let mut cfg = EffectiveConfig::defaults();
    let f = file.unwrap_or_default();

    cfg.binaries = f.binaries;
    cfg.working_dir = cli.cwd.clone().or(f.working_dir).unwrap_or(cfg.working_dir);
    cfg.python = sanitize_optional_string(python)
        .or(sanitize_optional_string(f.python))
        .unwrap_or(cfg.python);
    cfg.report_csv = cli.report_csv.clone().or(f.report_csv);
    cfg.report_json = cli.report_json.clone().or(f.report_json);

    cfg
}

fn lookup(name: &str) -> Result<AdapterInfo> {
    adapter_info(name).ok_or_else(|| anyhow!("Unknown adapter `{}` (see `list`)", name))
}

/// Parse `name=value` assignments against the adapter's schema.
fn parse_assignments(info: &AdapterInfo, assignments: &[String]) -> Result<InputRecord> {
    let mut inputs = InputRecord::new();
    for item in assignments {
        let (name, raw) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected NAME=VALUE, got `{}`", item))?;
        let name = name.trim();
        let field = find_field(info.fields, name)
            .ok_or_else(|| anyhow!("Adapter `{}` has no input `{}`", info.name, name))?;
        inputs.set(name, parse_value(field, raw)?);
    }
    Ok(inputs)
}

fn list_adapters() {
    for info in adapters() {
        println!("{:<16} {:<16} {}", info.name.bold(), info.binary, info.summary);
    }
    println!(
        "{:<16} {:<16} {}",
        "parcellate".bold(),
        "python",
        "cmtk parcellation of a FreeSurfer subject"
    );
}

fn describe_adapter(name: &str) -> Result<()> {
    let info = lookup(name)?;
    println!("{} ({}): {}", info.name.bold(), info.binary, info.summary);
    println!("\n{}", "Inputs".underline());
    for field in info.fields {
        let mut notes = Vec::new();
        if field.required {
            notes.push("required".to_string());
        }
        if let Some(template) = field.template {
            notes.push(format!("`{}`", template));
        }
        if !field.xor.is_empty() {
            notes.push(format!("excludes {}", field.xor.join(", ")));
        }
        println!(
            "  {:<26} {:<11} {} [{}]",
            field.name,
            field.kind.type_name(),
            field.desc,
            notes.join("; ")
        );
    }
    println!("\n{}", "Outputs".underline());
    for output in info.outputs {
        println!("  {:<26} {}", output.name, output.desc);
    }
    Ok(())
}

fn context_for(info: &AdapterInfo, binary: Option<String>, cfg: &EffectiveConfig) -> RunContext {
    let mut ctx = RunContext::new(cfg.working_dir.clone());
    let binary = sanitize_optional_string(binary)
        .or_else(|| cfg.binary_for(info.name).map(str::to_string));
    if let Some(binary) = binary {
        ctx = ctx.with_binary(binary);
    }
    ctx
}

fn print_cmdline(args: InvokeArgs, cfg_path: &Path) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, None, runtime_file);
    let info = lookup(&args.adapter)?;
    let inputs = parse_assignments(&info, &args.set)?;
    let ctx = context_for(&info, args.binary, &effective);

    let adapter =
        build_adapter(info.name, inputs).ok_or_else(|| anyhow!("Unknown adapter `{}`", info.name))?;
    println!("{}", command_line(adapter.as_ref(), &ctx)?);
    Ok(())
}

async fn run_adapter(args: InvokeArgs, cfg_path: &Path) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, None, runtime_file);
    let info = lookup(&args.adapter)?;
    let inputs = parse_assignments(&info, &args.set)?;
    let ctx = context_for(&info, args.binary, &effective);
    tokio::fs::create_dir_all(&ctx.cwd)
        .await
        .with_context(|| format!("Failed to create working directory {}", ctx.cwd.display()))?;

    let adapter =
        build_adapter(info.name, inputs).ok_or_else(|| anyhow!("Unknown adapter `{}`", info.name))?;
    ensure_binary(&ctx.program(adapter.as_ref()))?;
    let report = process_adapter(adapter.as_ref(), &ctx).await;
    finish_run(report, &effective)
}

/// Fail before launching anything when the wrapped tool cannot be started.
fn ensure_binary(program: &str) -> Result<()> {
    if !binary_available(program) {
        bail!(
            "`{}` not found. Install it or point `--binary` / `[binaries]` at it",
            program
        );
    }
    Ok(())
}

async fn run_parcellate(args: ParcellateArgs, cfg_path: &Path) -> Result<()> {
    let runtime_file = load_runtime_config(Some(cfg_path))?;
    let effective = merge_config(&args.shared, args.python.clone(), runtime_file);

    let mut parcellate = Parcellate::new(args.subject_id).with_scheme(args.scheme.into());
    if let Some(dir) = args.subjects_dir {
        parcellate = parcellate.with_subjects_dir(dir);
    }
    let backend = CmtkPythonBackend::new(effective.python.clone());
    let report = process_parcellation(
        &parcellate,
        &backend,
        &BuiltinSchemes,
        &effective.working_dir,
    )
    .await;
    finish_run(report, &effective)
}

fn finish_run(report: RunReport, effective: &EffectiveConfig) -> Result<()> {
    for (slot, path) in report.outputs.rows() {
        println!("{:<30} {}", slot, path.display());
    }
    write_reports(
        effective.report_csv.as_deref(),
        effective.report_json.as_deref(),
        std::slice::from_ref(&report),
    )?;

    match report.status.as_str() {
        "Failed" => bail!("{} failed: {}", report.adapter, report.reason.join("; ")),
        _ => Ok(()),
    }
}

fn run_scrape(args: ScrapeArgs) -> Result<()> {
    let stdout = std::fs::read_to_string(&args.stdout)
        .with_context(|| format!("Failed to read {}", args.stdout.display()))?;

    let files: ConvertedFiles = match args.converter {
        Converter::Dcm2nii => scrape(Dcm2niiScraper::new(&args.output_dir), &stdout),
        Converter::Dcm2niix => {
            let compression = Compression::from_flag(&args.compress)
                .ok_or_else(|| anyhow!("--compress must be y, i or n"))?;
            scrape(
                Dcm2niixScraper::new(&args.output_dir, compression, args.bids),
                &stdout,
            )
        }
    };
    println!("{}", serde_json::to_string_pretty(&files)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuro_adapters::schema::Value;
    use std::collections::BTreeMap;

    #[test]
    fn test_missing_binary_stops_run() {
        let err = ensure_binary("nonexistent_mrconvert_binary_xyz").unwrap_err();
        assert!(err.to_string().contains("nonexistent_mrconvert_binary_xyz"));
    }

    #[cfg(unix)]
    #[test]
    fn test_present_binary_passes_preflight() {
        assert!(ensure_binary("true").is_ok());
    }

    #[test]
    fn test_merge_config_precedence() {
        let cli = SharedArgs {
            cwd: Some(PathBuf::from("/cli")),
            ..Default::default()
        };
        let file = RuntimeConfigFile {
            binaries: BTreeMap::from([("mrinfo".to_string(), "/opt/mrtrix/mrinfo".to_string())]),
            working_dir: Some(PathBuf::from("/file")),
            python: Some("python3".into()),
            report_csv: None,
            report_json: Some(PathBuf::from("r.json")),
        };

        let cfg = merge_config(&cli, None, Some(file));
        assert_eq!(cfg.working_dir, PathBuf::from("/cli"));
        assert_eq!(cfg.python, "python3");
        assert_eq!(cfg.report_csv, None);
        assert_eq!(cfg.report_json, Some(PathBuf::from("r.json")));
        assert_eq!(cfg.binary_for("mrinfo"), Some("/opt/mrtrix/mrinfo"));

        let defaults = merge_config(&SharedArgs::default(), Some(" ".into()), None);
        assert_eq!(defaults.working_dir, PathBuf::from("."));
        assert_eq!(defaults.python, "python");
    }

    #[test]
    fn test_parse_assignments() {
        let info = lookup("mrconvert").unwrap();
        let inputs = parse_assignments(
            &info,
            &["in_file=dwi.mif".into(), "voxel_dims=1,1,2.5".into()],
        )
        .unwrap();
        assert_eq!(inputs.text("in_file"), Some("dwi.mif"));
        assert_eq!(
            inputs.get("voxel_dims"),
            Some(&Value::from(vec![1.0, 1.0, 2.5]))
        );

        assert!(parse_assignments(&info, &["in_file".into()]).is_err());
        assert!(parse_assignments(&info, &["bogus=1".into()]).is_err());
        assert!(lookup("bet").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "neuro_adapters",
            "-v",
            "run",
            "dwi2tensor",
            "--set",
            "in_file=dwi.mif",
            "--cwd",
            "/scratch",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.adapter, "dwi2tensor");
                assert_eq!(args.set, vec!["in_file=dwi.mif"]);
                assert_eq!(args.shared.cwd, Some(PathBuf::from("/scratch")));
            }
            _ => panic!("expected run"),
        }
    }
}
