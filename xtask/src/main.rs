use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../pacer-ebpf");
const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the XDP program for bpfel-unknown-none.
    BuildEbpf {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Build everything: the XDP program first, then the userspace agent.
    Build {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
    },
    /// Run the host-side test suites (no kernel or root needed).
    Test,
    /// Build everything and run the agent with sudo.
    Run {
        /// Build in release mode.
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent (e.g. `-i eth0`).
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Test => cargo(&["test", "--workspace"], "workspace tests"),
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_userspace(release)?;
            run(release, &args)
        }
    }
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(EBPF_DIR);
    cmd.args(["+nightly", "build", "--target", EBPF_TARGET, "-Z", "build-std=core"]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd.status().context("failed to run cargo build for eBPF")?;
    anyhow::ensure!(status.success(), "eBPF build failed");
    Ok(())
}

fn build_userspace(release: bool) -> anyhow::Result<()> {
    if release {
        cargo(&["build", "--workspace", "--release"], "workspace build")
    } else {
        cargo(&["build", "--workspace"], "workspace build")
    }
}

fn cargo(args: &[&str], what: &str) -> anyhow::Result<()> {
    let status = Command::new("cargo")
        .args(args)
        .status()
        .with_context(|| format!("failed to run cargo for {what}"))?;
    anyhow::ensure!(status.success(), "{what} failed");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let profile = profile(release);
    let bin = format!("target/{profile}/pacer");
    let object = format!("pacer-ebpf/target/{EBPF_TARGET}/{profile}/pacer");

    let status = Command::new("sudo")
        .arg(&bin)
        .args(["--bpf-object", object.as_str()])
        .args(extra_args)
        .status()
        .context("failed to run pacer")?;
    anyhow::ensure!(status.success(), "pacer exited with error");
    Ok(())
}
