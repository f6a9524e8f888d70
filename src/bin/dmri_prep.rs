use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use miette::IntoDiagnostic;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dmri_preprocessing::bids::BidsLayout;
use dmri_preprocessing::config::{ConfigLoader, ConfigOverrides};
use dmri_preprocessing::domain::{SessionLabel, SubjectLabel};
use dmri_preprocessing::error::PrepError;
use dmri_preprocessing::layout::WorkLayout;
use dmri_preprocessing::output::JsonOutput;
use dmri_preprocessing::tools::SystemToolRunner;
use dmri_preprocessing::workflow::Pipeline;

#[derive(Parser)]
#[command(name = "dmri-prep")]
#[command(about = "Diffusion MRI preprocessing of one BIDS participant session")]
#[command(version, author)]
struct Cli {
    #[arg(help = "Root of a BIDS dataset (sub-* folders at the top level)")]
    bids_dir: String,

    #[arg(help = "Where the derivatives tree is written")]
    output_dir: String,

    #[arg(value_enum)]
    analysis_level: AnalysisLevel,

    #[arg(long = "participant-label", alias = "participant_label")]
    participant_label: String,

    #[arg(long = "session-label", alias = "session_label")]
    session_label: String,

    #[arg(short = 'w', long = "work-dir", alias = "work_dir")]
    work_dir: Option<String>,

    #[arg(long = "n-cpus", aliases = ["n_cpus", "nthreads"])]
    n_cpus: Option<usize>,

    #[arg(long = "b0-threshold", alias = "b0_threshold")]
    b0_threshold: Option<u32>,

    #[arg(long = "dwi-denoise-window", alias = "dwi_denoise_window")]
    dwi_denoise_window: Option<u32>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, help = "Print the preprocessing plan as JSON without running any tool")]
    plan: bool,

    #[arg(long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum AnalysisLevel {
    Participant,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PrepError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PrepError) -> u8 {
    match error {
        PrepError::InvalidSubjectLabel(_)
        | PrepError::InvalidSessionLabel(_)
        | PrepError::InvalidPhaseEncoding(_)
        | PrepError::MalformedBvals { .. }
        | PrepError::BvecShape { .. }
        | PrepError::MissingFile(_)
        | PrepError::MissingMetadata { .. }
        | PrepError::InputNotFound(_)
        | PrepError::NoDwi
        | PrepError::NoLowBVolume(_)
        | PrepError::DwiMergeMismatch { .. }
        | PrepError::Nifti { .. }
        | PrepError::ConfigRead(_)
        | PrepError::ConfigParse(_)
        | PrepError::InvalidConfig(_) => 2,
        PrepError::MissingTool(_)
        | PrepError::ToolFailed { .. }
        | PrepError::EddyOutput { .. } => 3,
        PrepError::InternalInvariant(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let AnalysisLevel::Participant = cli.analysis_level;
    let subject: SubjectLabel = cli.participant_label.parse()?;
    let session: SessionLabel = cli.session_label.parse()?;

    let config = ConfigLoader::resolve(
        cli.config.as_deref(),
        ConfigOverrides {
            b0_threshold: cli.b0_threshold,
            n_cpus: cli.n_cpus,
            denoise_window: cli.dwi_denoise_window,
        },
    )?;

    let output_dir = Utf8PathBuf::from(cli.output_dir);
    let work_dir = cli
        .work_dir
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| output_dir.join("work"));
    let bids = BidsLayout::new(cli.bids_dir);
    let layout = WorkLayout::new(
        &work_dir,
        &output_dir,
        &config.application_name,
        subject,
        session,
    );
    let runner = SystemToolRunner::new();
    let pipeline = Pipeline::new(&runner, &bids, &layout, &config);

    if cli.plan {
        let plan = pipeline.plan()?;
        JsonOutput::print_plan(&plan).into_diagnostic()?;
        return Ok(());
    }

    info!(
        subject = %layout.subject(),
        session = %layout.session(),
        work = %layout.subject_root(),
        "starting preprocessing"
    );
    let outcome = pipeline.run()?;
    JsonOutput::print_outcome(&outcome).into_diagnostic()?;
    Ok(())
}
