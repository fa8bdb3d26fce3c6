use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_submit::app::{App, GenerateRequest, ProgressSink};
use kira_submit::config::{ConfigLoader, ResolvedConfig};
use kira_submit::credential::Credential;
use kira_submit::domain::{AssemblyName, PermanentAccession, ReceiptId, Stage};
use kira_submit::ena::{AccessionLookup, EnaReportClient};
use kira_submit::error::SubmitError;
use kira_submit::manifest::{AnnotationDirs, SequenceSource};
use kira_submit::output::{HumanOutput, JsonOutput, OutputMode, TracingSink};
use kira_submit::prompt::TerminalOperator;
use kira_submit::runner::{PlanOptions, ThreadPacer};
use kira_submit::webin::{ServiceOutput, ServiceRequest, SubmissionService, WebinCli};
use kira_submit::workspace::Workspace;

#[derive(Parser)]
#[command(name = "kira-submit")]
#[command(about = "Staged genome-assembly submission to ENA via Webin-CLI")]
#[command(version, author)]
struct Cli {
    /// Print reports as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./kira-submit.json, then the user config dir).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write one Webin manifest per assembly from the metadata table")]
    GenerateManifests(GenerateArgs),
    #[command(about = "Validate every manifest with Webin-CLI (no submission)")]
    Validate(StageArgs),
    #[command(about = "Submit to the Webin test service (nothing permanent)")]
    TestSubmit(StageArgs),
    #[command(about = "Submit to the production archive (asks for confirmation)")]
    Submit(StageArgs),
    #[command(about = "Collect receipt ids and GCA accessions from submit logs")]
    CollectAccessions(CollectArgs),
    #[command(about = "Show the latest stage results per assembly")]
    Status(OutputDirArg),
}

#[derive(Args, Clone)]
struct OutputDirArg {
    #[arg(long, short = 'o', default_value = ".")]
    output_dir: PathBuf,
}

#[derive(Args, Clone)]
struct GenerateArgs {
    #[command(flatten)]
    output: OutputDirArg,

    #[arg(long)]
    metadata: PathBuf,

    /// Accession-mapping table (assembly name to BioProject/BioSample/SRA).
    #[arg(long)]
    accessions: Option<PathBuf>,

    /// Directory of FASTA files, searched recursively.
    #[arg(long, required_unless_present = "flatfile_dir", conflicts_with = "flatfile_dir")]
    fasta_dir: Option<PathBuf>,

    /// Directory of gzipped annotated EMBL flat files (`<assembly>.embl.gz`).
    #[arg(long, requires = "chromosome_list_dir")]
    flatfile_dir: Option<PathBuf>,

    /// Directory of gzipped chromosome and unlocalised lists.
    #[arg(long, requires = "flatfile_dir")]
    chromosome_list_dir: Option<PathBuf>,

    /// Drop a trailing H/P haplotype marker from annotated assembly names.
    #[arg(long)]
    strip_haplotype_suffix: bool,

    /// Study (project) accession used when the mapping table has none.
    #[arg(long)]
    study: Option<String>,

    #[arg(long)]
    name_prefix: Option<String>,

    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Clone)]
struct StageArgs {
    #[command(flatten)]
    output: OutputDirArg,

    #[arg(long)]
    username: Option<String>,

    /// Read the Webin password from the first line of stdin instead of
    /// prompting.
    #[arg(long)]
    password_stdin: bool,

    /// Only run these assemblies (repeatable).
    #[arg(long = "assembly")]
    assemblies: Vec<String>,

    /// Leave out assemblies whose latest attempt of this stage passed.
    #[arg(long)]
    only_pending: bool,

    #[arg(long)]
    webin_jar: Option<PathBuf>,

    #[arg(long)]
    java: Option<String>,
}

#[derive(Args, Clone)]
struct CollectArgs {
    #[command(flatten)]
    output: OutputDirArg,

    /// Ask ENA for permanent accessions of pending receipts.
    #[arg(long)]
    query: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<SubmitError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &SubmitError) -> u8 {
    match error {
        SubmitError::Schema { .. }
        | SubmitError::DuplicateKey { .. }
        | SubmitError::Table { .. }
        | SubmitError::InvalidAssemblyName(_)
        | SubmitError::UnknownAssembly(_)
        | SubmitError::ConfigRead(_)
        | SubmitError::ConfigParse(_) => 2,
        SubmitError::RemoteService { .. }
        | SubmitError::MissingTool(_)
        | SubmitError::LookupHttp(_)
        | SubmitError::LookupStatus { .. } => 3,
        SubmitError::Credential(_) | SubmitError::ConfirmationDeclined => 4,
        _ => 1,
    }
}

/// `Ok(false)` when the command ran but some assemblies failed.
fn run() -> miette::Result<bool> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::GenerateManifests(args) => run_generate(args, config, mode),
        Commands::Validate(args) => run_stage(Stage::Validate, args, config, mode),
        Commands::TestSubmit(args) => run_stage(Stage::TestSubmit, args, config, mode),
        Commands::Submit(args) => run_stage(Stage::Submit, args, config, mode),
        Commands::CollectAccessions(args) => run_collect(args, config, mode),
        Commands::Status(args) => run_status(args, config, mode),
    }
}

fn sink_for(mode: OutputMode) -> Box<dyn ProgressSink> {
    match mode {
        OutputMode::Human => Box::new(TracingSink),
        OutputMode::Json => Box::new(JsonOutput),
    }
}

fn run_generate(
    args: GenerateArgs,
    mut config: ResolvedConfig,
    mode: OutputMode,
) -> miette::Result<bool> {
    if let Some(prefix) = args.name_prefix {
        config.manifest.name_prefix = prefix;
    }
    if args.strip_haplotype_suffix {
        config.manifest.strip_haplotype_suffix = true;
    }
    let sequences = match (args.fasta_dir, args.flatfile_dir, args.chromosome_list_dir) {
        (_, Some(flatfile_dir), Some(chromosome_list_dir)) => {
            SequenceSource::Annotated(AnnotationDirs {
                flatfile_dir,
                chromosome_list_dir,
            })
        }
        (Some(fasta_dir), _, _) => SequenceSource::Fasta(fasta_dir),
        _ => {
            return Err(SubmitError::Filesystem(
                "--fasta-dir, or --flatfile-dir with --chromosome-list-dir, is required"
                    .to_string(),
            )
            .into());
        }
    };
    let workspace = Workspace::from_std(&args.output.output_dir)?;
    let app = App::new(workspace, config, NopService, NopLookup);
    let request = GenerateRequest {
        metadata: args.metadata,
        accessions: args.accessions,
        sequences,
        study: args.study,
        dry_run: args.dry_run,
    };
    let result = app.generate_manifests(&request, sink_for(mode).as_ref())?;
    match mode {
        OutputMode::Json => JsonOutput::print_generate(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_generate(&result),
    }
    Ok(result.manifests.failed() == 0)
}

fn run_stage(
    stage: Stage,
    args: StageArgs,
    mut config: ResolvedConfig,
    mode: OutputMode,
) -> miette::Result<bool> {
    if let Some(username) = args.username {
        config.webin.username = Some(username);
    }
    if let Some(jar) = args.webin_jar {
        config.webin.jar = jar;
    }
    if let Some(java) = args.java {
        config.webin.java = java;
    }
    let only = args
        .assemblies
        .iter()
        .map(|name| name.parse::<AssemblyName>())
        .collect::<Result<Vec<_>, _>>()?;
    let options = PlanOptions {
        only,
        only_pending: args.only_pending,
    };

    let workspace = Workspace::from_std(&args.output.output_dir)?;
    let service = WebinCli::locate(&config.webin)?;
    let app = App::new(workspace, config, service, NopLookup);
    let operator = TerminalOperator::new(args.password_stdin);
    let report = app.run_stage(
        stage,
        &options,
        &operator,
        &ThreadPacer,
        sink_for(mode).as_ref(),
    )?;
    match mode {
        OutputMode::Json => JsonOutput::print_stage(&report).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_stage(&report),
    }
    Ok(report.all_passed())
}

fn run_collect(args: CollectArgs, config: ResolvedConfig, mode: OutputMode) -> miette::Result<bool> {
    let workspace = Workspace::from_std(&args.output.output_dir)?;
    let lookup = EnaReportClient::new(&config.ena.report_url)?;
    let app = App::new(workspace, config, NopService, lookup);
    let report = app.collect_accessions(args.query, &ThreadPacer, sink_for(mode).as_ref())?;
    match mode {
        OutputMode::Json => JsonOutput::print_collect(&report).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_collect(&report),
    }
    Ok(report.lookup_failures.is_empty())
}

fn run_status(args: OutputDirArg, config: ResolvedConfig, mode: OutputMode) -> miette::Result<bool> {
    let workspace = Workspace::from_std(&args.output_dir)?;
    let app = App::new(workspace, config, NopService, NopLookup);
    let result = app.status(sink_for(mode).as_ref())?;
    match mode {
        OutputMode::Json => JsonOutput::print_status(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_status(&result),
    }
    Ok(true)
}

struct NopService;
struct NopLookup;

impl SubmissionService for NopService {
    fn run(
        &self,
        request: &ServiceRequest,
        _credential: &Credential,
    ) -> Result<ServiceOutput, SubmitError> {
        Err(SubmitError::MissingTool(format!(
            "no submission service configured for {}",
            request.stage
        )))
    }
}

impl AccessionLookup for NopLookup {
    fn lookup(&self, _receipt: &ReceiptId) -> Result<Option<PermanentAccession>, SubmitError> {
        Ok(None)
    }
}
