//! asarctl - Inspect asar archives.
//!
//! Offers the same queries as the library on the command line: stat a path, list a directory,
//! show raw addressing data, copy a file out, and check content integrity.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use asarfs::{factory::ArchiveFactory, Archive, ArchiveError};

/// Inspect asar archives.
#[derive(Parser, Debug)]
#[command(name = "asarctl", version, about)]
struct Cli {
    /// The archive to operate on.
    archive: PathBuf,

    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what a path is, following links.
    Stat {
        /// Path inside the archive.
        path: String,
    },
    /// List the entries of a directory.
    Ls {
        /// Path inside the archive; the root if omitted.
        #[arg(default_value = "")]
        path: String,
    },
    /// Show the size and location of a file's contents.
    Info {
        /// Path inside the archive.
        path: String,
    },
    /// Copy a file out to a temporary file and print its path.
    Extract {
        /// Path inside the archive.
        path: String,
    },
    /// Check file contents against the integrity data in the index.
    Verify {
        /// Path inside the archive; every file if omitted.
        path: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let factory = ArchiveFactory::new();
    let archive = factory
        .try_get_or_create(&cli.archive)
        .with_context(|| format!("Opening archive {:?}", cli.archive))?;

    match &cli.command {
        Command::Stat { path } => cmd_stat(&archive, path),
        Command::Ls { path } => cmd_ls(&archive, path),
        Command::Info { path } => cmd_info(&archive, path),
        Command::Extract { path } => cmd_extract(&archive, path),
        Command::Verify { path: Some(path) } => cmd_verify(&archive, path),
        Command::Verify { path: None } => cmd_verify_all(&archive),
    }
}

fn cmd_stat(archive: &Archive, path: &str) -> Result<()> {
    let stats = archive.try_stat(path)?;
    let kind = if stats.is_file { "file" } else { "directory" };
    println!("path:   {path}");
    println!("type:   {kind}{}", if stats.is_link { " (via link)" } else { "" });
    if stats.is_file {
        println!("size:   {}", stats.size);
        println!("offset: {}", stats.offset);
    }
    Ok(())
}

fn cmd_ls(archive: &Archive, path: &str) -> Result<()> {
    for name in archive.try_readdir(path)? {
        println!("{name}");
    }
    Ok(())
}

fn cmd_info(archive: &Archive, path: &str) -> Result<()> {
    let info = archive.try_file_info(path)?;
    println!("size:       {}", info.size);
    if info.unpacked {
        println!("unpacked:   {:?}", archive.unpacked_dir());
    } else {
        println!("offset:     {}", info.offset);
    }
    println!("executable: {}", info.executable);
    Ok(())
}

fn cmd_extract(archive: &Archive, path: &str) -> Result<()> {
    let real = archive
        .try_copy_file_out(path)
        .with_context(|| format!("Extracting {path:?}"))?;
    println!("{}", real.display());
    Ok(())
}

fn cmd_verify(archive: &Archive, path: &str) -> Result<()> {
    archive.verify(path)?;
    println!("{path}: OK");
    Ok(())
}

fn cmd_verify_all(archive: &Archive) -> Result<()> {
    let mut failures = 0;
    for (path, entry) in archive.tree().files() {
        if entry.integrity.is_none() {
            continue;
        }
        match archive.verify(&path) {
            Ok(()) => println!("{path}: OK"),
            Err(err @ ArchiveError::IntegrityMismatch { .. }) => {
                println!("{path}: FAILED");
                eprintln!("{err}");
                failures += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("Verifying {path:?}")),
        }
    }
    if failures > 0 {
        bail!("{failures} file(s) failed verification");
    }
    Ok(())
}
