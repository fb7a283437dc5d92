//! Command-line argument parsing.

use clap::Parser;

/// vmplane Node Daemon - host-level VM control plane
#[derive(Parser, Debug)]
#[command(name = "vmplane-node")]
#[command(about = "vmplane Node Daemon - host-level VM control plane")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Listen address for the REST API
    #[arg(long)]
    pub listen: Option<String>,

    /// Number of tasks allowed to run at once
    #[arg(long)]
    pub workers: Option<usize>,

    /// Directory holding lifecycle hook scripts
    #[arg(long)]
    pub hooks_dir: Option<String>,

    /// Enable development mode (mock hypervisor and storage)
    #[arg(long)]
    pub dev: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::parse_from([
            "vmplane-node",
            "--listen",
            "127.0.0.1:7000",
            "--workers",
            "4",
            "--dev",
            "--log-json",
        ]);
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:7000"));
        assert_eq!(args.workers, Some(4));
        assert!(args.dev);
        assert!(args.log_json);
        assert_eq!(args.log_level, "info");
        assert!(args.config.is_none());
    }
}
