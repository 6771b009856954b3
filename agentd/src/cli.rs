//! C11 — CLI entrypoint surface.
//!
//! Grounded on the teacher's `Args` struct in `main.rs`: a small
//! `clap`-derived set of flags for operators, everything else comes
//! from the config file.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agentd")]
#[command(about = "Userspace core of a kernel runtime-security agent")]
pub struct Args {
    /// Path to the config file. Overrides `SENTRYWATCH_CONFIG` if both are set.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory the kernel maps and event perf array are pinned under.
    #[arg(long, value_name = "DIR")]
    pub pin_dir: Option<PathBuf>,

    /// Validate config and kernel map availability, then exit without running.
    #[arg(long)]
    pub dry_run: bool,

    /// Skip opening kernel maps entirely; run the pipeline in a
    /// userspace-only mode useful for exercising the reorderer/resolver
    /// against synthetic input.
    #[arg(long)]
    pub probe_only: bool,

    /// Append resolved events as JSON lines to this file, in addition
    /// to any rule-engine sink.
    #[arg(long, value_name = "PATH")]
    pub jsonl_out: Option<PathBuf>,

    /// Override the configured log level (e.g. "debug", "warn").
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_no_arguments() {
        let args = Args::parse_from(["agentd"]);
        assert!(args.config.is_none());
        assert!(!args.dry_run);
        assert!(!args.probe_only);
    }

    #[test]
    fn parses_flags_and_overrides() {
        let args = Args::parse_from([
            "agentd",
            "--config",
            "/tmp/sentrywatch.toml",
            "--pin-dir",
            "/sys/fs/bpf/sentrywatch",
            "--dry-run",
            "--log-level",
            "debug",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/sentrywatch.toml")));
        assert_eq!(args.pin_dir, Some(PathBuf::from("/sys/fs/bpf/sentrywatch")));
        assert!(args.dry_run);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
