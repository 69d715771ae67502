//! machload - inspect, extract, and copy ARM Mach-O images.
//!
//! A thin driver over the loader library: it loads, prints, resolves, and
//! stores. Pattern scanning, relocation, and injection live elsewhere.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use machload::{load_file, open_cache, Binary, CacheMode, CpuTarget};

/// Loader and inspector for ARM Mach-O images, fat archives, and dyld caches.
#[derive(Parser, Debug)]
#[command(name = "machload")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Target architecture for thin/fat image loads
    #[arg(short, long, global = true, default_value = "arm")]
    arch: CpuTarget,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print header and segment information for one or more images
    Info {
        /// Image files (thin or fat)
        files: Vec<PathBuf>,
    },

    /// Resolve symbols in an image
    Sym {
        /// Image file (thin or fat)
        file: PathBuf,

        /// Symbol names to resolve
        names: Vec<String>,

        /// Resolve to executable addresses (tag Thumb definitions)
        #[arg(short, long)]
        exec: bool,
    },

    /// Load an image and store its segments to a new file
    Copy {
        /// Input image
        file: PathBuf,

        /// Output path
        output: PathBuf,
    },

    /// Print dyld shared cache information
    CacheInfo {
        /// Cache file
        cache: PathBuf,
    },

    /// Extract one image from a dyld shared cache
    Extract {
        /// Cache file
        cache: PathBuf,

        /// Exact install path of the image (e.g. /usr/lib/libSystem.B.dylib)
        image: String,

        /// Output path
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Info { files } => cmd_info(&files, cli.arch),
        Commands::Sym { file, names, exec } => cmd_sym(&file, &names, exec, cli.arch),
        Commands::Copy { file, output } => cmd_copy(&file, &output, cli.arch),
        Commands::CacheInfo { cache } => cmd_cache_info(&cache),
        Commands::Extract {
            cache,
            image,
            output,
        } => cmd_extract(&cache, &image, &output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

/// Batch info over several inputs: one failed item is reported and the loop
/// continues with the next.
fn cmd_info(files: &[PathBuf], arch: CpuTarget) -> Result<()> {
    let mut failures = 0usize;
    for path in files {
        match load_file(path, arch) {
            Ok(binary) => print_info(path, &binary),
            Err(e) => {
                error!("{}: {e}", path.display());
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} inputs failed", files.len());
    }
    Ok(())
}

fn print_info(path: &Path, binary: &Binary) {
    println!("{}:", path.display());
    if let Some(header) = binary.mach_header() {
        println!("  {header}");
    }
    println!("  cpusubtype: {}", binary.cpusubtype());
    println!(
        "  symbols: {} ({} external)",
        binary.symbol_count(),
        binary.external_symbol_count()
    );
    for seg in binary.segments() {
        println!(
            "  {:<16} vm {:#010x}+{:#x} file {:#x}+{:#x}",
            seg.name(),
            seg.vmaddr,
            seg.vmsize,
            seg.fileoff,
            seg.filesize
        );
    }
}

fn cmd_sym(file: &Path, names: &[String], exec: bool, arch: CpuTarget) -> Result<()> {
    let binary = load_file(file, arch)
        .with_context(|| format!("failed to load {}", file.display()))?;
    let mut failures = 0usize;
    for name in names {
        match binary.resolve_symbol(name, exec) {
            Ok(addr) => println!("{name} {addr:#010x}"),
            Err(e) => {
                error!("{e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} of {} symbols failed", names.len());
    }
    Ok(())
}

fn cmd_copy(file: &Path, output: &Path, arch: CpuTarget) -> Result<()> {
    let binary = load_file(file, arch)
        .with_context(|| format!("failed to load {}", file.display()))?;
    binary
        .store(output)
        .with_context(|| format!("failed to store {}", output.display()))?;
    println!("stored {} segments to {}", binary.segments().len(), output.display());
    Ok(())
}

fn cmd_cache_info(cache: &Path) -> Result<()> {
    let binary = open_cache(cache, CacheMode::Fresh)
        .with_context(|| format!("failed to open cache {}", cache.display()))?;
    let index = binary.cache_index().expect("cache load populates the index");

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:     {}", cache.display());
    println!("Header:   {}", index.header);
    println!("Images:   {}", index.images.len());
    println!("Mappings: {}", index.mappings.len());

    println!("\nMappings:");
    for (i, mapping) in index.mappings.iter().enumerate() {
        println!("  [{i:2}] {mapping}");
    }

    println!("\nImages:");
    for image in &index.images {
        println!("  {:#010x} {}", image.address, image.path);
    }
    Ok(())
}

fn cmd_extract(cache: &Path, image: &str, output: &Path) -> Result<()> {
    let mut binary = open_cache(cache, CacheMode::Fresh)
        .with_context(|| format!("failed to open cache {}", cache.display()))?;
    binary
        .select_cache_image(image)
        .with_context(|| format!("failed to locate {image}"))?;
    binary
        .store(output)
        .with_context(|| format!("failed to store {}", output.display()))?;
    println!("extracted {image} to {}", output.display());
    Ok(())
}
