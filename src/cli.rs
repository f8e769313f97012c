//! Command-line surface.
//!
//! The short option names are the stable contract (scripts send signals to a
//! running exectop and parse its `-r` output); long aliases exist for
//! readability. `-s` and `-i` are taken as plain strings and validated in
//! [`Cli::resolve`] so a bad value exits with status 1 like every other fatal
//! error.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::prelude::*;
use crate::report::SortKey;

const LONG_ABOUT: &str = "\
Display live statistics about exec() system calls, gathered from the kernel's \
process-event connector. Root privileges are required.

Send SIGUSR1 to get a fresh summary at any time, SIGUSR2 to get one and reset \
the counters, or use -i for periodic output.

The per-command list shows the most frequently exec()ed (or longest running) \
commands. The subtree list attributes every exec to all ancestors of the \
executing process, which is how you find the script of hell forking 300 awk \
per second; its percentages intentionally do not sum to 100. Times are \
exit-minus-exec wall clock, not CPU time (a sleep accounts for its full \
duration). Commands whose /proc entry disappeared before it could be read are \
reported as (vanished).";

#[derive(Parser, Debug)]
#[command(name = "exectop", version, about = "Live per-command exec() statistics", long_about = LONG_ABOUT)]
pub struct Cli {
    /// Output file for reports (default: stderr)
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Sort criteria for the top sections: "count" or "time"
    #[arg(short = 's', long = "sort", value_name = "KEY", default_value = "count")]
    pub sort: String,

    /// Interval between automatic reports (eg: 30s, 10m, 2h); 0 disables
    #[arg(short = 'i', long = "interval", value_name = "DURATION")]
    pub interval: Option<String>,

    /// Output stats in a raw format that is easier to parse from scripts
    #[arg(short = 'r', long = "raw")]
    pub raw: bool,

    /// Reset the counters after every automatic report
    #[arg(short = 'c', long = "clear")]
    pub clear: bool,

    /// Number of rows in the top sections
    #[arg(short = 't', long = "top", value_name = "N", default_value_t = 10)]
    pub top: usize,
}

/// Validated options.
#[derive(Debug)]
pub struct Options {
    pub output: Option<PathBuf>,
    pub sort: SortKey,
    pub interval: Option<Duration>,
    pub raw: bool,
    pub clear_after_report: bool,
    pub top: usize,
}

impl Cli {
    pub fn resolve(self) -> Result<Options> {
        let sort = match self.sort.as_str() {
            "count" => SortKey::Count,
            "time" => SortKey::Time,
            other => bail!("unknown sort criteria '{other}'; use -s 'count' or 'time'"),
        };
        let interval = self
            .interval
            .as_deref()
            .map(parse_interval)
            .transpose()
            .context("invalid interval")?
            .flatten();
        Ok(Options {
            output: self.output,
            sort,
            interval,
            raw: self.raw,
            clear_after_report: self.clear,
            top: self.top,
        })
    }
}

/// Parse an interval: humantime formats ("30s", "10m") or a bare number of
/// seconds. Zero means "no periodic reports".
fn parse_interval(s: &str) -> Result<Option<Duration>> {
    let s = s.trim();
    let duration = if let Ok(seconds) = s.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            bail!("'{s}' is not a valid duration");
        }
        Duration::from_secs_f64(seconds)
    } else {
        humantime::parse_duration(s)
            .with_context(|| format!("'{s}' is not a valid duration (expected eg: 30s, 10m, 2h)"))?
    };
    Ok((!duration.is_zero()).then_some(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("exectop").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let opts = parse(&[]).resolve().unwrap();
        assert_eq!(opts.sort, SortKey::Count);
        assert_eq!(opts.top, 10);
        assert!(opts.interval.is_none());
        assert!(opts.output.is_none());
        assert!(!opts.raw);
        assert!(!opts.clear_after_report);
    }

    #[test]
    fn test_short_options() {
        let opts = parse(&["-o", "/tmp/x.out", "-s", "time", "-i", "30s", "-r", "-c", "-t", "5"])
            .resolve()
            .unwrap();
        assert_eq!(opts.output.as_deref(), Some(std::path::Path::new("/tmp/x.out")));
        assert_eq!(opts.sort, SortKey::Time);
        assert_eq!(opts.interval, Some(Duration::from_secs(30)));
        assert!(opts.raw);
        assert!(opts.clear_after_report);
        assert_eq!(opts.top, 5);
    }

    #[test]
    fn test_invalid_sort_key() {
        let err = parse(&["-s", "cpu"]).resolve().unwrap_err();
        assert!(err.to_string().contains("unknown sort criteria"));
    }

    #[test]
    fn test_interval_formats() {
        assert_eq!(
            parse_interval("10m").unwrap(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(parse_interval("2").unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(
            parse_interval("1.5").unwrap(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_interval("0").unwrap(), None);
        assert_eq!(parse_interval("0s").unwrap(), None);
        assert!(parse_interval("soon").is_err());
        assert!(parse_interval("-3").is_err());
    }
}
