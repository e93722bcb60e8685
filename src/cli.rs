//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Queue content pages for download and unpack them into a local library.
///
/// Each URL is either a supported content page or a direct provider link.
/// Items are processed one at a time in queue order; interrupted downloads
/// resume from their part files on the next run.
#[derive(Parser, Debug)]
#[command(name = "vaultdl")]
#[command(author, version, about)]
pub struct Args {
    /// Content page or provider URLs to enqueue
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/vaultdl/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Library directory for finished items
    #[arg(short = 'o', long)]
    pub download_dir: Option<PathBuf>,

    /// Directory for part files and merged archives
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Speed cap in KiB/s (0 for unlimited)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=10_485_760))]
    pub speed_limit: Option<u64>,

    /// Never hand transfers to an external accelerator
    #[arg(long)]
    pub no_accelerator: bool,

    /// Print the persisted queue and exit
    #[arg(long, conflicts_with_all = ["urls", "remove", "wipe_cache"])]
    pub list: bool,

    /// Remove an item (by content hash) and its cache files, then exit
    #[arg(long, value_name = "HASH", conflicts_with_all = ["urls", "wipe_cache"])]
    pub remove: Option<String>,

    /// Delete everything in the cache directory, then exit
    #[arg(long, conflicts_with = "urls")]
    pub wipe_cache: bool,

    /// Requeue items left in error or stopped state before starting
    #[arg(long)]
    pub retry_failed: bool,
}

impl Args {
    /// True when the invocation only inspects or edits state.
    #[must_use]
    pub fn is_maintenance(&self) -> bool {
        self.list || self.remove.is_some() || self.wipe_cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["vaultdl"]).unwrap();
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.urls.is_empty());
        assert_eq!(args.speed_limit, None);
        assert!(!args.is_maintenance());
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["vaultdl", "-v"]).unwrap();
        assert_eq!(args.verbose, 1);

        let args = Args::try_parse_from(["vaultdl", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_quiet_flag_sets_quiet() {
        let args = Args::try_parse_from(["vaultdl", "--quiet"]).unwrap();
        assert!(args.quiet);
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["vaultdl", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_invalid_flag_returns_error() {
        let err = Args::try_parse_from(["vaultdl", "--invalid-flag"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_cli_urls_and_overrides() {
        let args = Args::try_parse_from([
            "vaultdl",
            "-o",
            "/games",
            "--cache-dir",
            "/tmp/cache",
            "-l",
            "2048",
            "--no-accelerator",
            "https://steamrip.com/celeste-free-download/",
            "https://buzzheavier.com/abc",
        ])
        .unwrap();
        assert_eq!(args.urls.len(), 2);
        assert_eq!(args.download_dir, Some(PathBuf::from("/games")));
        assert_eq!(args.cache_dir, Some(PathBuf::from("/tmp/cache")));
        assert_eq!(args.speed_limit, Some(2048));
        assert!(args.no_accelerator);
    }

    #[test]
    fn test_cli_list_conflicts_with_urls() {
        let err = Args::try_parse_from(["vaultdl", "--list", "https://x.test/a"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_cli_remove_is_maintenance() {
        let args = Args::try_parse_from(["vaultdl", "--remove", "abc123"]).unwrap();
        assert_eq!(args.remove.as_deref(), Some("abc123"));
        assert!(args.is_maintenance());
    }

    #[test]
    fn test_cli_speed_limit_over_max_rejected() {
        let err = Args::try_parse_from(["vaultdl", "-l", "99999999"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
