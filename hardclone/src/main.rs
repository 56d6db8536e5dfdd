mod progress;

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Input, Password, Select, theme::ColorfulTheme};
use hardclone_core::artifact::ImageArtifact;
use hardclone_core::controller::{CreateRequest, OperationController, RestoreRequest};
use hardclone_core::device::{Device, format_size};
use hardclone_core::error::EXIT_FAILURE;
use hardclone_core::executor::{ConfirmationToken, ExecutionOptions};
use hardclone_core::pipeline::{self, Operation, PipelineRequest, TransformSelection};
use hardclone_core::stage::{
    Backend, Compression, Direction, Encryption, Passphrase, PlannedStage, StageKind, TransformStage,
};
use hardclone_core::{naming, platform, rawio, verify};
use progress::ProgressObserver;
use std::io::{IsTerminal, stdin, stdout};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

#[derive(Parser)]
#[command(name = "hardclone")]
#[command(about = "Create and restore compressed, encrypted disk and partition images", version)]
struct Cli {
    /// Increase log output (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Run stages with built-in codecs or with external programs
    #[arg(long, env = "HARDCLONE_BACKEND", default_value_t = Backend::Native, global = true)]
    backend: Backend,

    /// Raw device I/O block size
    #[arg(long, env = "HARDCLONE_BLOCK_SIZE", default_value = "1M", value_parser = parse_block_size, global = true)]
    block_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an image of a partition or disk, interactively unless --source is given
    Create(CreateArgs),
    /// Restore an image onto a partition, disk or file
    Restore(RestoreArgs),
    /// Validate an image against its checksum sidecars
    Check {
        /// Image file, or any of its split parts
        image: PathBuf,
    },
    /// Show the pipeline recorded in an image file name
    Inspect {
        image: PathBuf,
    },
    /// List disks, or the partitions of one disk
    List {
        /// Disk to list partitions of, e.g. /dev/sda
        disk: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Partition, disk or image file to read
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Output path without extensions [default: /tmp/backup_<partition>]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Encrypt with aes256 or chacha20
    #[arg(short, long, value_name = "CIPHER")]
    encrypt: Option<String>,

    /// Compress with gzip, xz or zstd
    #[arg(short, long, value_name = "CODEC")]
    compress: Option<String>,

    /// Split into parts of at most SIZE (e.g. 1G, 500M, 2048K)
    #[arg(long, value_name = "SIZE")]
    split: Option<String>,

    /// Restore the image in memory afterwards and compare it with the source
    #[arg(long)]
    verify: bool,

    /// Write SHA-256 and MD5 sidecars
    #[arg(long)]
    checksum: bool,

    #[arg(long, env = "HARDCLONE_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

#[derive(Args)]
struct RestoreArgs {
    /// Image file, or any of its split parts
    image: PathBuf,

    /// Partition, disk or file to overwrite
    #[arg(short, long)]
    destination: Option<PathBuf>,

    /// Stages applied at creation, in order, for images whose name does not
    /// record them (e.g. aes256,xz)
    #[arg(long, value_delimiter = ',', value_name = "STAGES")]
    stages: Option<Vec<String>>,

    /// Validate checksum sidecars before writing (automatic when they exist)
    #[arg(long)]
    check_checksum: bool,

    #[arg(long, env = "HARDCLONE_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Do not ask for confirmation
    #[arg(short = 'y', long)]
    yes: bool,
}

fn parse_block_size(text: &str) -> std::result::Result<usize, String> {
    let size = pipeline::parse_size(text).map_err(|e| e.to_string())?;
    let size = usize::try_from(size).map_err(|_| format!("block size '{text}' is too large"))?;
    rawio::check_block_size(size).map_err(|e| e.to_string())?;
    Ok(size)
}

/// On Unix, disables `ECHOCTL` so Ctrl+C is not echoed as `^C` over the
/// progress bars. The original terminal state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original_termios = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn theme() -> ColorfulTheme {
    ColorfulTheme::default()
}

fn interactive() -> bool {
    stdin().is_terminal()
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[Device], prompt: &str) -> Result<Device> {
    if devices.is_empty() {
        return Err(anyhow!("No storage devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    let selection = Select::with_theme(&theme())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

fn confirm(prompt: &str, default: bool) -> Result<bool> {
    Ok(Confirm::with_theme(&theme())
        .with_prompt(prompt)
        .default(default)
        .interact()?)
}

fn warn_if_not_root(path: &Path) {
    if path.starts_with("/dev") && !platform::running_as_root() {
        println!(
            "{} raw device access usually requires root privileges.",
            style("WARNING:").yellow().bold()
        );
    }
}

fn select_algorithm(prompt: &str, names: &[&'static str]) -> Result<String> {
    let selection = Select::with_theme(&theme())
        .with_prompt(prompt)
        .items(names)
        .default(0)
        .interact()?;
    Ok(names[selection].to_string())
}

fn yes_no(flag: bool, detail: impl FnOnce() -> String) -> String {
    if flag { format!("YES ({})", detail()) } else { "NO".to_string() }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();

    // Dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            let code = e
                .downcast_ref::<hardclone_core::Error>()
                .map_or(EXIT_FAILURE, hardclone_core::Error::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Cleared by Ctrl+C to cancel a running pipeline.
    let running = Arc::new(AtomicBool::new(true));
    let options = ExecutionOptions {
        backend: cli.backend,
        block_size: cli.block_size,
        running: running.clone(),
    };

    match cli.command {
        Commands::Create(args) => {
            let r = running.clone();
            ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;
            create(args, options)
        }
        Commands::Restore(args) => {
            let r = running.clone();
            ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;
            restore(args, options)
        }
        Commands::Check { image } => check(&image),
        Commands::Inspect { image } => inspect(&image),
        Commands::List { disk } => list(disk.as_deref()),
    }
}

fn create(args: CreateArgs, options: ExecutionOptions) -> Result<()> {
    let prompting = args.source.is_none();
    let source = match args.source {
        Some(source) => source,
        None => {
            let disks = platform::list_disks()?;
            let disk = select_device(&disks, "Select storage device")?;
            let partitions = platform::list_partitions(&disk.path)?;
            if partitions.is_empty() {
                return Err(anyhow!("No partitions found on device {}", disk.path.display()));
            }
            select_device(&partitions, &format!("Select partition on {}", disk.path.display()))?.path
        }
    };
    warn_if_not_root(&source);

    let default_output = PathBuf::from("/tmp").join(format!(
        "backup_{}",
        source.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    let output = match args.output {
        Some(output) => output,
        None if prompting => PathBuf::from(
            Input::<String>::with_theme(&theme())
                .with_prompt("Destination path for the image (extensions are added)")
                .default(default_output.display().to_string())
                .interact_text()?,
        ),
        None => default_output,
    };

    let encrypt = match args.encrypt {
        Some(cipher) => Some(cipher),
        None if prompting && confirm("Encrypt the image file?", false)? => {
            let names = Encryption::ALL.map(Encryption::name);
            Some(select_algorithm("Cipher", &names)?)
        }
        None => None,
    };
    let compress = match args.compress {
        Some(codec) => Some(codec),
        None if prompting && confirm("Compress the image file?", false)? => {
            let names = Compression::ALL.map(Compression::name);
            Some(select_algorithm("Compression", &names)?)
        }
        None => None,
    };
    let split = match args.split {
        Some(size) => Some(size),
        None if prompting && confirm("Split file into smaller parts?", false)? => Some(
            Input::<String>::with_theme(&theme())
                .with_prompt("Maximum size for each part (e.g. 1G, 500M, 2048K)")
                .default("1G".to_string())
                .validate_with(|s: &String| pipeline::parse_size(s).map(|_| ()).map_err(|e| e.to_string()))
                .interact_text()?,
        ),
        None => None,
    };
    let verify = args.verify || (prompting && confirm("Verify the image after writing?", true)?);
    let checksum = args.checksum || (prompting && confirm("Write SHA-256/MD5 checksum files?", true)?);

    let passphrase = match (&encrypt, args.passphrase) {
        (Some(_), Some(p)) => Some(Passphrase::new(p)),
        (Some(_), None) if interactive() => Some(Passphrase::new(
            Password::with_theme(&theme())
                .with_prompt("Encryption password")
                .with_confirmation("Confirm encryption password", "Passwords do not match!")
                .interact()?,
        )),
        (Some(_), None) => return Err(anyhow!("encryption requires --passphrase or HARDCLONE_PASSPHRASE")),
        (None, _) => None,
    };

    let mut selections = Vec::new();
    if let Some(cipher) = &encrypt {
        selections.push(TransformSelection::encryption(cipher.clone()));
    }
    if let Some(codec) = &compress {
        selections.push(TransformSelection::compression(codec.clone()));
    }
    let request = CreateRequest {
        source,
        output,
        selections,
        passphrase,
        split_size: split,
        verify,
        checksums: checksum,
    };

    // Validates the whole request before anything is shown or run.
    let preview = pipeline::build(&PipelineRequest {
        operation: Operation::Create,
        source: request.source.clone(),
        sink: request.output.clone(),
        selections: request.selections.clone(),
        passphrase: request.passphrase.clone(),
        split_size: request.split_size.clone(),
        verify,
        checksums: checksum,
    })?;
    let artifact_name = naming::encode_path(&request.output, &preview.applied_stages());
    let stage_named = |kind: StageKind| {
        preview
            .stages
            .iter()
            .find(|p| p.stage.kind() == kind)
            .map(|p| p.stage.algorithm())
    };

    println!();
    println!("{}", style("OPERATION SUMMARY").bold());
    println!("  Source:         {}", style(request.source.display()).cyan());
    println!("  Output file:    {}", style(artifact_name.display()).cyan());
    println!(
        "  Encryption:     {}",
        yes_no(encrypt.is_some(), || stage_named(StageKind::Encryption).unwrap_or_default().to_string())
    );
    println!(
        "  Compression:    {}",
        yes_no(compress.is_some(), || stage_named(StageKind::Compression).unwrap_or_default().to_string())
    );
    println!(
        "  File splitting: {}",
        yes_no(request.split_size.is_some(), || request.split_size.clone().unwrap_or_default())
    );
    println!("  Verify:         {}", if verify { "YES" } else { "NO" });
    println!("  Checksums:      {}", if checksum { "YES" } else { "NO" });
    let replaced = ImageArtifact::existing_outputs(&artifact_name)?;
    if !replaced.is_empty() {
        println!(
            "{} {} existing file(s) from an earlier image will be replaced:",
            style("WARNING:").yellow().bold(),
            replaced.len()
        );
        for path in &replaced {
            println!("    {}", path.display());
        }
    }
    println!();

    if !args.yes && !confirm("Continue with operation?", true)? {
        println!("Operation cancelled by user.");
        return Ok(());
    }
    if let Some(dir) = artifact_name.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }

    let observer = ProgressObserver::new("Imaging", args.yes).compressing(compress.is_some());
    let mut controller = OperationController::new(options).with_observer(observer.clone());
    let outcome = controller.create(&request).inspect_err(|_| observer.clear())?;

    println!(
        "\n✨ Partition image created successfully!\n  Location: {}",
        style(outcome.artifact.path.display()).cyan()
    );
    if outcome.artifact.is_split() {
        println!(
            "  Split into {} parts of at most {}",
            outcome.artifact.parts.len(),
            request.split_size.unwrap_or_default()
        );
    }
    println!(
        "  {} read, {} written",
        format_size(outcome.execution.bytes_read),
        format_size(outcome.execution.bytes_written)
    );
    if let Some(report) = &outcome.checksums {
        println!("  SHA-256: {}", report.sha256);
        println!("  MD5:     {}", report.md5);
    }
    Ok(())
}

fn parse_stage(name: &str) -> Result<TransformSelection> {
    TransformStage::lookup(StageKind::Compression, name)
        .or_else(|_| TransformStage::lookup(StageKind::Encryption, name))
        .map(TransformSelection::from)
        .map_err(|_| anyhow!("unknown stage '{name}' (expected one of aes256, chacha20, gz, xz, zst)"))
}

/// Asks which stages produced an image whose name does not record them.
fn prompt_declared_stages() -> Result<Vec<TransformSelection>> {
    let mut stages = Vec::new();
    if confirm("Was the image encrypted?", false)? {
        let names = Encryption::ALL.map(Encryption::name);
        stages.push(TransformSelection::encryption(select_algorithm("Cipher", &names)?));
    }
    if confirm("Was the image compressed (after encryption)?", false)? {
        let names = Compression::ALL.map(Compression::name);
        stages.push(TransformSelection::compression(select_algorithm("Compression", &names)?));
    }
    Ok(stages)
}

fn restore(args: RestoreArgs, options: ExecutionOptions) -> Result<()> {
    let artifact = ImageArtifact::discover(&args.image)?;

    let declared = match args.stages {
        Some(names) => Some(names.iter().map(|n| parse_stage(n.trim())).collect::<Result<Vec<_>>>()?),
        None => match artifact.decode_name() {
            Ok(_) => None,
            Err(e) if interactive() => {
                println!("{} {e}", style("WARNING:").yellow().bold());
                if !confirm("Declare the image's stages manually?", false)? {
                    return Err(e.into());
                }
                Some(prompt_declared_stages()?)
            }
            Err(e) => return Err(e.into()),
        },
    };
    let stages: Vec<TransformSelection> = match &declared {
        Some(stages) => stages.clone(),
        None => artifact.decode_name()?.stages.into_iter().map(Into::into).collect(),
    };
    let encrypted = stages.iter().any(|s| s.kind == StageKind::Encryption);

    let destination = match args.destination {
        Some(destination) => destination,
        None => {
            let mut devices = Vec::new();
            for disk in platform::list_disks()? {
                let partitions = platform::list_partitions(&disk.path)?;
                devices.push(disk);
                devices.extend(partitions);
            }
            select_device(&devices, "Select the target device to RESTORE to")?.path
        }
    };
    warn_if_not_root(&destination);

    let passphrase = match args.passphrase {
        Some(p) if encrypted => Some(Passphrase::new(p)),
        None if encrypted && interactive() => Some(Passphrase::new(
            Password::with_theme(&theme()).with_prompt("Decryption password").interact()?,
        )),
        None if encrypted => return Err(anyhow!("decryption requires --passphrase or HARDCLONE_PASSPHRASE")),
        _ => None,
    };

    let has_sidecar = artifact
        .files()
        .first()
        .is_some_and(|f| verify::sidecar_path(f, verify::SHA256_EXTENSION).is_file());
    let check_checksums = args.check_checksum || has_sidecar;

    let size = rawio::probe(&destination).map(|h| format_size(h.len)).unwrap_or_else(|_| "new file".to_string());
    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        destination.display(),
        size
    );
    println!("  Image:       {}", style(artifact.path.display()).cyan());
    println!("  Destination: {}", style(destination.display()).cyan());
    let order: Vec<String> = stages
        .iter()
        .rev()
        .filter_map(|s| TransformStage::lookup(s.kind, &s.algorithm).ok())
        .map(|stage| {
            PlannedStage {
                stage,
                direction: Direction::Inverse,
            }
            .label()
        })
        .collect();
    println!(
        "  Pipeline:    {}",
        if order.is_empty() { "raw copy".to_string() } else { order.join(" -> ") }
    );
    println!("  Checksums:   {}", if check_checksums { "checked first" } else { "not checked" });
    println!();

    if !args.yes && !confirm("Are you sure you want to proceed?", false)? {
        println!("Restore operation cancelled.");
        return Ok(());
    }
    println!();

    let request = RestoreRequest {
        artifact: artifact.path.clone(),
        destination: destination.clone(),
        declared_stages: declared,
        passphrase,
        check_checksums,
        confirmation: Some(ConfirmationToken::confirm(&destination)),
    };
    let observer = ProgressObserver::new("Restoring", args.yes);
    let mut controller = OperationController::new(options).with_observer(observer.clone());
    let outcome = controller.restore(&request).inspect_err(|_| observer.clear())?;

    println!(
        "\n✨ Successfully restored {} to {} ({}).",
        style(outcome.artifact.path.display()).cyan(),
        style(destination.display()).cyan(),
        format_size(outcome.execution.bytes_written)
    );
    Ok(())
}

fn check(image: &Path) -> Result<()> {
    let artifact = ImageArtifact::discover(image)?;
    match verify::find_checksum_mismatch(&artifact)? {
        None => {
            for file in artifact.files() {
                println!("{}: {}", file.display(), style("OK").green());
            }
            Ok(())
        }
        Some((path, algorithm)) => {
            println!("{}: {}", path.display(), style("FAILED").red().bold());
            Err(hardclone_core::Error::ChecksumMismatch { path, algorithm }.into())
        }
    }
}

fn inspect(image: &Path) -> Result<()> {
    let logical = hardclone_core::split::strip_part_suffix(image).unwrap_or_else(|| image.to_path_buf());
    let decoded = naming::decode(&logical.to_string_lossy())?;

    println!("Base name:     {}", decoded.base);
    let applied: Vec<String> = decoded.stages.iter().map(ToString::to_string).collect();
    println!(
        "Applied:       {}",
        if applied.is_empty() { "none".to_string() } else { applied.join(", ") }
    );
    let order: Vec<String> = decoded
        .stages
        .iter()
        .rev()
        .map(|&stage| {
            PlannedStage {
                stage,
                direction: Direction::Inverse,
            }
            .label()
        })
        .collect();
    println!(
        "Restore order: {}",
        if order.is_empty() { "raw copy".to_string() } else { order.join(" -> ") }
    );

    if let Ok(artifact) = ImageArtifact::discover(image) {
        println!("Files:");
        for file in artifact.files() {
            let len = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
            println!("  {:<60} {:>9}", file.display(), format_size(len));
        }
        println!("Total size:    {}", format_size(artifact.len()?));
    }
    Ok(())
}

fn list(disk: Option<&Path>) -> Result<()> {
    let disks = match disk {
        Some(path) => {
            let partitions = platform::list_partitions(path)?;
            if partitions.is_empty() {
                println!("No partitions found on device {}.", path.display());
            }
            for partition in partitions {
                println!("  {partition}");
            }
            return Ok(());
        }
        None => platform::list_disks()?,
    };

    if disks.is_empty() {
        println!("No storage devices found.");
        return Ok(());
    }
    println!("Found {} storage devices:\n", disks.len());
    for disk in disks {
        println!("{disk}");
        for partition in platform::list_partitions(&disk.path)? {
            println!("  └ {partition}");
        }
    }
    Ok(())
}
