mod report;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use radiodata_core::container::AdapterContext;
use radiodata_core::{
    Board, ContainerKind, ConversionTarget, Converter, FirmwareVersion, ProfileConfig, RawImage, RuleRegistry,
    SchemaTable, TracingObserver,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Radio EEPROM backup inspector and converter", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Conversion profile (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a backup and show its contents and decode diagnostics
    Inspect {
        path: PathBuf,

        /// Board the backup is expected to be for
        #[arg(long)]
        board: Option<Board>,
    },
    /// Convert a backup to another schema version, board or format
    Convert {
        input: PathBuf,
        output: PathBuf,

        /// Target schema version (default: latest registered)
        #[arg(long)]
        to_version: Option<FirmwareVersion>,

        /// Target board (default: the backup's board)
        #[arg(long)]
        to_board: Option<Board>,

        /// Output format (default: from the output extension)
        #[arg(long)]
        format: Option<ContainerKind>,

        /// Write the conversion ledger as TOML
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List registered schema versions
    Schemas,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut profile = match &args.config {
        Some(path) => ProfileConfig::load_from_file(path)
            .with_context(|| format!("loading profile {}", path.display()))?,
        None => ProfileConfig::default(),
    };
    let schemas = profile.schema_table()?;

    match args.command {
        Command::Inspect { path, board } => {
            if board.is_some() {
                profile.board = board;
            }
            inspect(&profile, &schemas, &path)
        }
        Command::Convert {
            input,
            output,
            to_version,
            to_board,
            format,
            report,
        } => {
            if to_version.is_some() {
                profile.target_version = to_version;
            }
            let request = ConvertRequest {
                input,
                output,
                to_board,
                format,
                report,
            };
            convert(&profile, &schemas, &request)
        }
        Command::Schemas => {
            list_schemas(&schemas);
            Ok(())
        }
    }
}

fn read_image(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage> {
    let kind = ContainerKind::detect(path)?;
    info!(path = %path.display(), kind = %kind, "Reading backup");
    let image = kind
        .read(path, ctx)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(image)
}

fn inspect(profile: &ProfileConfig, schemas: &SchemaTable, path: &Path) -> Result<()> {
    let observer = TracingObserver;
    let ctx = profile.adapter_context(schemas, &observer);
    let image = read_image(path, &ctx)?;

    let rules = RuleRegistry::builtin();
    let decoded = Converter::new(schemas, &rules).decode(&image, &profile.conversion_options())?;

    println!("Format:  {}", image.kind());
    println!("Board:   {}", decoded.settings.board);
    println!("Version: {}", decoded.settings.version);
    println!("Size:    {} bytes", image.len());
    if let Some(crc) = image.checksum() {
        println!("CRC-32:  {crc:08X}");
    }
    println!();

    let used: Vec<_> = decoded.settings.used_models().collect();
    println!("Models ({} of {}):", used.len(), decoded.settings.models.len());
    for (slot, model) in used {
        let name = model
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let labels: Vec<&str> = image.metadata().labels_for(slot).collect();
        if labels.is_empty() {
            println!("  {slot:>2}  {name}");
        } else {
            println!("  {slot:>2}  {name:<12} [{}]", labels.join(", "));
        }
    }

    if !decoded.ledger.is_empty() {
        println!();
        println!("Decode diagnostics:");
        report::print_events(&decoded.ledger, true);
    }
    Ok(())
}

struct ConvertRequest {
    input: PathBuf,
    output: PathBuf,
    to_board: Option<Board>,
    format: Option<ContainerKind>,
    report: Option<PathBuf>,
}

fn convert(profile: &ProfileConfig, schemas: &SchemaTable, request: &ConvertRequest) -> Result<()> {
    let observer = TracingObserver;
    let ctx = profile.adapter_context(schemas, &observer);
    let image = read_image(&request.input, &ctx)?;

    let board = request.to_board.unwrap_or(image.board());
    let version = match profile.target_version {
        Some(v) => v,
        None => schemas
            .latest(board)
            .map(|s| s.version)
            .ok_or_else(|| anyhow!("no schema registered for {board}"))?,
    };
    let target = ConversionTarget { board, version };

    let rules = RuleRegistry::builtin();
    let output = Converter::new(schemas, &rules).convert_image(&image, target, &profile.conversion_options())?;

    let kind = request
        .format
        .or_else(|| ContainerKind::from_extension(&request.output))
        .unwrap_or(image.kind());
    kind.write(&output.image, &request.output, &ctx)
        .with_context(|| format!("writing {}", request.output.display()))?;
    info!(path = %request.output.display(), kind = %kind, target = %target, "Backup written");

    report::print_summary(&output.ledger);
    if output.ledger.needs_review() {
        println!();
        report::print_events(&output.ledger, true);
    }

    if let Some(path) = &request.report {
        let source = format!("{} v{}", image.board(), image.version());
        report::write_report(path, &source, &target.to_string(), &output.ledger)?;
        info!(path = %path.display(), "Ledger report written");
    }
    Ok(())
}

fn list_schemas(schemas: &SchemaTable) {
    println!("{:<8} {:<8} {:>7} {:>7} {:>10}", "BOARD", "FAMILY", "VERSION", "MODELS", "SIZE");
    for schema in schemas.iter() {
        println!(
            "{:<8} {:<8} {:>7} {:>7} {:>10}",
            schema.board.to_string(),
            schema.family.to_string(),
            schema.version.to_string(),
            schema.max_models,
            schema.image_size()
        );
    }
}
