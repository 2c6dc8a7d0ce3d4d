use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

/// Name of the eBPF binary target inside `pmucount-ebpf`
const EBPF_BIN: &str = "pmucount";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel-side counting programs
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Rust toolchain passed to cargo as `+<toolchain>`
        #[arg(long, default_value = "nightly")]
        toolchain: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, toolchain } => build_ebpf(&target, &toolchain)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, toolchain: &str) -> Result<()> {
    // Release only: debug builds pull in formatting code the BPF linker rejects.
    let status = Command::new("cargo")
        .arg(format!("+{toolchain}"))
        .args(["build", "--package", "pmucount-ebpf", "--target", target])
        .args(["-Z", "build-std=core", "--release"])
        .status()
        .context("Failed to run cargo for the eBPF build")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF program");
    }

    let artifact = workspace_root().join("target").join(target).join("release").join(EBPF_BIN);
    if !artifact.exists() {
        anyhow::bail!("eBPF build succeeded but {} is missing", artifact.display());
    }

    println!("✓ eBPF program built successfully");
    println!("  Artifact: {}", artifact.display());
    println!("  Run with: sudo ./target/release/pmucount --ebpf {} ...", artifact.display());

    Ok(())
}

fn workspace_root() -> PathBuf {
    let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    manifest.parent().map_or(manifest.clone(), PathBuf::from)
}
