use aya::programs::XdpFlags;
use clap::ValueEnum;
use serde::Deserialize;
use std::fs;
use std::path::Path;

const DEFAULT_BPF_OBJECT: &str = "pacer-ebpf/target/bpfel-unknown-none/debug/pacer";

/// How the XDP program is attached to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum XdpMode {
    /// Let the kernel pick (native if supported, generic otherwise).
    #[default]
    Default,
    /// Generic (skb) mode, works on every interface.
    Skb,
    /// Native driver mode.
    Driver,
    /// Offloaded to the NIC.
    Hw,
}

impl From<XdpMode> for XdpFlags {
    fn from(mode: XdpMode) -> Self {
        match mode {
            XdpMode::Default => XdpFlags::default(),
            XdpMode::Skb => XdpFlags::SKB_MODE,
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Hw => XdpFlags::HW_MODE,
        }
    }
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interfaces to attach the XDP program to.
    #[serde(default = "default_interfaces")]
    pub interfaces: Vec<String>,

    /// XDP attach mode.
    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Path to the compiled eBPF object.
    #[serde(default = "default_bpf_object")]
    pub bpf_object: String,

    /// Metrics/API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Forget sources not seen for this many seconds (None = keep forever).
    #[serde(default)]
    pub stale_after_seconds: Option<u64>,

    /// Enable reverse DNS resolution in the sources listing.
    #[serde(default)]
    pub resolve_dns: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

fn default_bpf_object() -> String {
    DEFAULT_BPF_OBJECT.to_string()
}

fn default_port() -> u16 {
    3030
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            xdp_mode: XdpMode::default(),
            bpf_object: default_bpf_object(),
            port: default_port(),
            quiet: false,
            stale_after_seconds: None,
            resolve_dns: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        anyhow::ensure!(
            !config.interfaces.is_empty(),
            "at least one interface must be configured"
        );
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if !cli.interfaces.is_empty() {
            self.interfaces = cli.interfaces.clone();
        }
        if let Some(mode) = cli.xdp_mode {
            self.xdp_mode = mode;
        }
        if let Some(ref path) = cli.bpf_object {
            self.bpf_object = path.clone();
        }
        if cli.port != default_port() {
            self.port = cli.port;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.stale_after.is_some() {
            self.stale_after_seconds = cli.stale_after;
        }
        if cli.resolve_dns {
            self.resolve_dns = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// pacer: per-source packet accounting via an XDP tap
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Interface to attach the XDP program to (e.g., eth0). Repeat for multiple.
    #[arg(short, long = "interface")]
    pub interfaces: Vec<String>,

    /// XDP attach mode.
    #[arg(long, value_enum)]
    pub xdp_mode: Option<XdpMode>,

    /// Path to the compiled eBPF object.
    #[arg(long)]
    pub bpf_object: Option<String>,

    /// Port to serve metrics and the API on.
    #[arg(short, long, default_value_t = 3030)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Forget sources not seen for this many seconds.
    #[arg(long)]
    pub stale_after: Option<u64>,

    /// Enable reverse DNS resolution for source addresses.
    #[arg(long)]
    pub resolve_dns: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
