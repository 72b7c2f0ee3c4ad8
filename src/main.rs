//! unionfs - Copy-on-write union filesystem
//!
//! Usage:
//!   unionfs init --upper <dir> --lower <dir>...  - Write a configuration
//!   unionfs mount [target]                       - Mount the union
//!   unionfs unmount [target]                     - Unmount the union
//!   unionfs status                               - Show layers and mount state
//!   unionfs ls|cat|stat|write|mkdir|rm|mv|ln|glob  - Operate on the merged view
//!   unionfs export <dest>                        - Flatten the merged view

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::FileType;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use unionfs::{
    config::{BackendKind, Config, OverlayConfig},
    fs::{export, sys, ReadFs, UnionFs},
    mount::{backend_for, effective_kind},
    Error,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "unionfs")]
#[command(author = "unionfs Contributors")]
#[command(version)]
#[command(about = "Copy-on-write union filesystem")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/unionfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration file
    Init {
        /// Writable layer; omit for a read-only union
        #[arg(long)]
        upper: Option<PathBuf>,

        /// Read-only layer, lowest priority first (repeatable)
        #[arg(long = "lower")]
        lower: Vec<PathBuf>,

        /// Scratch directory for the kernel overlay
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Mount point
        #[arg(long)]
        target: Option<PathBuf>,

        /// Mount backend (auto, kernel, fuse, none)
        #[arg(long)]
        backend: Option<BackendKind>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show layers and mount state
    Status,

    /// Mount the union
    Mount {
        /// Mount point (defaults to the configured target)
        target: Option<PathBuf>,

        /// Stay attached to the terminal
        #[arg(short, long)]
        foreground: bool,
    },

    /// Unmount the union
    Unmount {
        /// Mount point (defaults to the configured target)
        target: Option<PathBuf>,
    },

    /// List a directory of the merged view
    Ls {
        #[arg(default_value = "/")]
        path: PathBuf,

        /// Show mode, size and providing layer
        #[arg(short, long)]
        long: bool,
    },

    /// Print a file
    Cat { path: PathBuf },

    /// Show where an entry resolves
    Stat { path: PathBuf },

    /// Write stdin to a file
    Write {
        path: PathBuf,

        /// Octal mode for a new file
        #[arg(long, value_parser = parse_mode, default_value = "644")]
        mode: u32,
    },

    /// Create a directory
    Mkdir {
        path: PathBuf,

        /// Create missing parents
        #[arg(short, long)]
        parents: bool,

        /// Octal mode
        #[arg(long, value_parser = parse_mode, default_value = "755")]
        mode: u32,
    },

    /// Remove an entry
    Rm {
        path: PathBuf,

        /// Remove directories and their contents
        #[arg(short, long)]
        recursive: bool,
    },

    /// Rename an entry
    Mv { from: PathBuf, to: PathBuf },

    /// Create a link
    Ln {
        /// Create a symbolic link
        #[arg(short, long)]
        symbolic: bool,

        target: PathBuf,
        link: PathBuf,
    },

    /// List paths matching a glob pattern
    Glob { pattern: String },

    /// Copy the merged view into a plain directory
    Export {
        dest: PathBuf,

        /// Export only this subtree
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            upper,
            lower,
            workdir,
            target,
            backend,
            force,
        } => cmd_init(config_path, upper, lower, workdir, target, backend, force),

        Commands::Status => cmd_status(config_path),

        Commands::Mount { target, foreground } => cmd_mount(config_path, target, foreground),

        Commands::Unmount { target } => cmd_unmount(config_path, target),

        Commands::Ls { path, long } => cmd_ls(config_path, &path, long),

        Commands::Cat { path } => cmd_cat(config_path, &path),

        Commands::Stat { path } => cmd_stat(config_path, &path),

        Commands::Write { path, mode } => cmd_write(config_path, &path, mode),

        Commands::Mkdir {
            path,
            parents,
            mode,
        } => cmd_mkdir(config_path, &path, parents, mode),

        Commands::Rm { path, recursive } => cmd_rm(config_path, &path, recursive),

        Commands::Mv { from, to } => cmd_mv(config_path, &from, &to),

        Commands::Ln {
            symbolic,
            target,
            link,
        } => cmd_ln(config_path, symbolic, &target, &link),

        Commands::Glob { pattern } => cmd_glob(config_path, &pattern),

        Commands::Export { dest, from } => cmd_export(config_path, &dest, from.as_deref()),
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))
}

fn open_union(config: &Config) -> Result<UnionFs> {
    UnionFs::from_config(&config.overlay).context("Failed to open union")
}

fn cmd_init(
    config_path: &Path,
    upper: Option<PathBuf>,
    lower: Vec<PathBuf>,
    workdir: Option<PathBuf>,
    target: Option<PathBuf>,
    backend: Option<BackendKind>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{:?} already exists; pass --force to overwrite it",
            config_path
        );
    }

    let mut overlay = OverlayConfig::new(
        upper.as_deref().map(expand_tilde),
        lower.iter().map(|p| expand_tilde(p.as_path())).collect(),
    );
    overlay.workdir = workdir.as_deref().map(expand_tilde);
    overlay.target = target.as_deref().map(expand_tilde);

    let mut config = Config {
        overlay,
        ..Default::default()
    };
    if let Some(backend) = backend {
        config.mount.backend = backend;
    }
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let overlay = &config.overlay;

    println!("unionfs Status");
    println!("==============");
    println!("Config:   {:?}", config_path);
    match overlay.upper_dir() {
        Some(upper) => println!("Upper:    {:?}", upper),
        None => println!("Upper:    (none, read-only)"),
    }
    println!("Lower (highest priority first):");
    for layer in overlay.lower.iter().rev() {
        let state = if layer.is_dir() { "" } else { "  [missing]" };
        println!("  {:?}{}", layer, state);
    }
    if let Some(workdir) = &overlay.workdir {
        println!("Workdir:  {:?}", workdir);
    }

    println!();
    println!(
        "Backend:  {:?} (effective: {:?})",
        config.mount.backend,
        effective_kind(config.mount.backend)
    );
    match &overlay.target {
        Some(target) => {
            println!("Target:   {:?}", target);
            println!("Mounted:  {}", if is_mounted(target) { "yes" } else { "no" });
        }
        None => println!("Target:   (not set)"),
    }

    Ok(())
}

fn cmd_mount(config_path: &Path, target: Option<PathBuf>, foreground: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(target) = target {
        config.overlay.target = Some(expand_tilde(&target));
    }

    if effective_kind(config.mount.backend) == BackendKind::Fuse {
        return mount_fuse(&config, foreground);
    }

    let backend = backend_for(&config, None)?;
    backend.mount()?;
    info!("Mounted using the {} backend", backend.name());
    Ok(())
}

/// A FUSE session lives as long as this process, so it always runs attached
#[cfg(unix)]
fn mount_fuse(config: &Config, foreground: bool) -> Result<()> {
    let target = config
        .overlay
        .target
        .clone()
        .context("Mount target is not set")?;
    let union = std::sync::Arc::new(open_union(config)?);
    if !foreground {
        info!("Serving {:?} in the foreground; unmount it to exit", target);
    }
    unionfs::mount::fuse::mount_foreground(union, &target, &config.mount)?;
    info!("Unmounted {:?}", target);
    Ok(())
}

#[cfg(not(unix))]
fn mount_fuse(_config: &Config, _foreground: bool) -> Result<()> {
    Err(Error::MountUnavailable.into())
}

fn cmd_unmount(config_path: &Path, target: Option<PathBuf>) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(target) = target {
        config.overlay.target = Some(expand_tilde(&target));
    }

    info!("Unmounting {:?}...", config.overlay.target);

    // The FUSE session belongs to whichever process mounted it
    if effective_kind(config.mount.backend) == BackendKind::Fuse {
        let target = config
            .overlay
            .target
            .clone()
            .context("Mount target is not set")?;
        return unmount_external(&target);
    }

    backend_for(&config, None)?.unmount()?;
    Ok(())
}

#[cfg(unix)]
fn unmount_external(target: &Path) -> Result<()> {
    if cfg!(target_os = "linux") && !is_mounted(target) {
        info!("{:?} is not mounted", target);
        return Ok(());
    }

    // Use fusermount/umount
    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(target)
        .output()
        .context("Failed to run fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(target)
        .output()
        .context("Failed to run umount")?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        bail!(
            "Failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )
    }
}

#[cfg(not(unix))]
fn unmount_external(_target: &Path) -> Result<()> {
    Err(Error::MountUnavailable.into())
}

#[cfg(target_os = "linux")]
fn is_mounted(target: &Path) -> bool {
    unionfs::mount::kernel::is_mounted_at(target).unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_mounted(_target: &Path) -> bool {
    false
}

fn cmd_ls(config_path: &Path, path: &Path, long: bool) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;

    for entry in union.read_dir(path)? {
        let mut name = entry.name.to_string_lossy().into_owned();
        if entry.is_dir() {
            name.push('/');
        }

        if !long {
            println!("{}", name);
            continue;
        }

        let metadata = union.lstat(&entry.path)?;
        if entry.file_type.is_symlink() {
            let target = union.read_link(&entry.path)?;
            name = format!("{} -> {}", name, target.display());
        }
        println!(
            "{} {:04o} {:>10} {:<5} {}",
            kind_char(&entry.file_type),
            sys::mode_of(&metadata) & 0o7777,
            metadata.len(),
            if entry.is_upper { "upper" } else { "lower" },
            name
        );
    }

    Ok(())
}

fn cmd_cat(config_path: &Path, path: &Path) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    let data = union.read_file(path)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data)?;
    stdout.flush()?;
    Ok(())
}

fn cmd_stat(config_path: &Path, path: &Path) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    let lookup = union.lookup(path)?;

    println!("Path:   {}", path.display());
    println!("Type:   {}", kind_name(&lookup.metadata.file_type()));
    println!("Size:   {}", lookup.metadata.len());
    println!("Mode:   {:04o}", sys::mode_of(&lookup.metadata) & 0o7777);
    println!("Layer:  {:?}", lookup.layer.root());
    println!(
        "Origin: {}",
        if lookup.is_upper { "upper" } else { "lower (copy-up on write)" }
    );
    if lookup.is_symlink() {
        println!("Target: {}", union.read_link(path)?.display());
    }

    Ok(())
}

fn cmd_write(config_path: &Path, path: &Path, mode: u32) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;

    let mut data = Vec::new();
    std::io::stdin()
        .read_to_end(&mut data)
        .context("Failed to read stdin")?;
    union.write_file(path, &data, mode)?;

    info!("Wrote {} bytes to {:?}", data.len(), path);
    Ok(())
}

fn cmd_mkdir(config_path: &Path, path: &Path, parents: bool, mode: u32) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    if parents {
        union.mkdir_all(path, mode)?;
    } else {
        union.mkdir(path, mode)?;
    }
    Ok(())
}

fn cmd_rm(config_path: &Path, path: &Path, recursive: bool) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    if recursive {
        union.remove_all(path)?;
    } else {
        union.remove(path)?;
    }
    Ok(())
}

fn cmd_mv(config_path: &Path, from: &Path, to: &Path) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    union.rename(from, to)?;
    Ok(())
}

fn cmd_ln(config_path: &Path, symbolic: bool, target: &Path, link: &Path) -> Result<()> {
    if !symbolic {
        return Err(Error::Unsupported("hard links across layers".into()).into());
    }
    let union = open_union(&load_config(config_path)?)?;
    union.symlink(target, link)?;
    Ok(())
}

fn cmd_glob(config_path: &Path, pattern: &str) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    for path in union.glob(pattern)? {
        println!("{}", path.display());
    }
    Ok(())
}

fn cmd_export(config_path: &Path, dest: &Path, from: Option<&Path>) -> Result<()> {
    let union = open_union(&load_config(config_path)?)?;
    let dest = expand_tilde(dest);

    let stats = match from {
        Some(dir) => export(&union.sub(dir)?, &dest)?,
        None => export(&union, &dest)?,
    };

    println!("Exported to {:?}", dest);
    println!("  Files:    {}", stats.files);
    println!("  Dirs:     {}", stats.dirs);
    println!("  Symlinks: {}", stats.symlinks);
    println!("  Bytes:    {}", stats.bytes);
    Ok(())
}

fn parse_mode(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("'{}' is not an octal mode", s)),
    }
}

fn kind_name(file_type: &FileType) -> &'static str {
    if file_type.is_dir() {
        "directory"
    } else if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_file() {
        "file"
    } else {
        "special"
    }
}

fn kind_char(file_type: &FileType) -> char {
    if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'l'
    } else if file_type.is_file() {
        '-'
    } else {
        '?'
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
