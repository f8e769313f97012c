//! Report rendering and output.
//!
//! A report is rendered into a string while the graph lock is held (so it sees
//! one consistent snapshot) and written out after the lock is released. Write
//! failures drop the report with a warning; the accounting is untouched.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use itertools::Itertools;

use crate::prelude::*;
use crate::tracker::graph::CommandStats;
use crate::tracker::{Graph, Tracker};

/// Sort criteria for both top sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Count,
    Time,
}

impl SortKey {
    pub fn label(self) -> &'static str {
        match self {
            SortKey::Count => "number of exec",
            SortKey::Time => "execution time",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub sort: SortKey,
    pub top: usize,
    pub raw: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            sort: SortKey::Count,
            top: 10,
            raw: false,
        }
    }
}

/// Serializes report output to one sink (a file or stderr).
pub struct Reporter {
    out: Mutex<Box<dyn Write + Send>>,
    opts: ReportOptions,
}

impl Reporter {
    pub fn new(out: Box<dyn Write + Send>, opts: ReportOptions) -> Self {
        Self {
            out: Mutex::new(out),
            opts,
        }
    }

    /// Snapshot the graph and emit one report.
    pub fn emit(&self, tracker: &Tracker) {
        let text = tracker.with_graph(|g| render(g, &self.opts));
        self.write(&text);
    }

    /// Append a free-form line to the report sink (e.g. the shutdown notice).
    pub fn note(&self, line: &str) {
        self.write(&format!("{line}\n"));
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap();
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            warn!("dropping report: {err}");
        }
    }
}

const RULE_WIDTH: usize = 80;
const RULE_MARGIN: usize = 5;

fn rule(out: &mut String, title: &str) {
    if title.is_empty() {
        out.push_str(&"-".repeat(RULE_WIDTH));
        out.push('\n');
    } else if RULE_MARGIN + title.len() >= RULE_WIDTH {
        out.push_str(&"-".repeat(RULE_WIDTH));
        out.push('\n');
        out.push_str(title);
        out.push('\n');
    } else {
        out.push_str(&"-".repeat(RULE_MARGIN));
        out.push_str(title);
        out.push_str(&"-".repeat(RULE_WIDTH - RULE_MARGIN - title.len()));
        out.push('\n');
    }
}

fn fmt_ns(ns: u64) -> String {
    humantime::format_duration(Duration::from_nanos(ns)).to_string()
}

/// Render a full report from a locked graph snapshot.
pub fn render(g: &Graph, opts: &ReportOptions) -> String {
    let mut out = String::new();
    let elapsed = g.elapsed();
    let dts = elapsed.as_secs_f64().max(1e-9);

    render_header(&mut out, g, elapsed, dts);
    render_per_command(&mut out, g, opts, dts);
    if !opts.raw {
        render_histogram(&mut out, g);
    }
    render_subtrees(&mut out, g, opts, dts);
    rule(&mut out, "");
    out
}

fn render_header(out: &mut String, g: &Graph, elapsed: Duration, dts: f64) {
    let c = &g.counters;
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let started = humantime::format_rfc3339_seconds(g.session_start());
    let now = humantime::format_rfc3339_seconds(SystemTime::now());
    let since = humantime::format_duration(Duration::from_secs(elapsed.as_secs()));
    // Forks are a superset of execs; anything left over never exec'd.
    let forks_wo_exec = c.fork_events.saturating_sub(c.exec_events);

    rule(out, "");
    out.push_str(&format!("hostname:           {hostname}\n"));
    out.push_str(&format!("date:               {now}\n"));
    out.push_str(&format!("session started:    {started} ({since} ago)\n"));
    out.push_str(&format!(
        "total exec calls:   {} ({:.2}e/s)\n",
        c.exec_events,
        c.exec_events as f64 / dts
    ));
    out.push_str(&format!(
        "forks w/o exec:     {} ({:.2}f/s)\n",
        forks_wo_exec,
        forks_wo_exec as f64 / dts
    ));
    out.push_str(&format!("distinct commands:  {}\n", g.command_count()));
    out.push_str(&format!(
        "removed/vanished:   {}/{}\n",
        c.removed, c.vanished
    ));
}

fn render_per_command(out: &mut String, g: &Graph, opts: &ReportOptions, dts: f64) {
    rule(
        out,
        &format!(" top {} commands sorted by {} ", opts.top, opts.sort.label()),
    );

    let key = |c: &CommandStats| match opts.sort {
        SortKey::Count => c.exec_count,
        SortKey::Time => c.exec_time_total,
    };
    let rows: Vec<&CommandStats> = g.commands().filter(|c| key(c) != 0).collect();
    // Percentages are over every candidate command, not just the printed rows.
    let total_count: u64 = rows.iter().map(|c| c.exec_count).sum();
    let total_time: u64 = rows.iter().map(|c| c.exec_time_total).sum();

    for cmd in rows
        .iter()
        .sorted_by(|a, b| key(b).cmp(&key(a)))
        .take(opts.top)
    {
        let name = cmd.display_name();
        let count_pct = percent(cmd.exec_count, total_count);
        let rate = cmd.exec_count as f64 / dts;
        if cmd.exec_time_total != 0 {
            let time_pct = percent(cmd.exec_time_total, total_time);
            let time = fmt_ns(cmd.exec_time_total);
            if opts.raw {
                out.push_str(&format!(
                    "pp:{name}:{count_pct:.2}:{}:{rate:.2}:{time}:{time_pct:.2}\n",
                    cmd.exec_count
                ));
            } else {
                out.push_str(&format!(
                    "{name}: {count_pct:.2}% ({}) {rate:.2}e/s {time} ({time_pct:.2}%)\n",
                    cmd.exec_count
                ));
            }
        } else if opts.raw {
            out.push_str(&format!(
                "pp:{name}:{count_pct:.2}:{}:{rate:.2}::\n",
                cmd.exec_count
            ));
        } else {
            out.push_str(&format!(
                "{name}: {count_pct:.2}% ({}) {rate:.2}e/s\n",
                cmd.exec_count
            ));
        }
    }
}

fn render_histogram(out: &mut String, g: &Graph) {
    let Some((first, last)) = g.histogram.span() else {
        // Nothing measured yet; skip the section entirely.
        return;
    };
    let total = g.histogram.total();
    rule(
        out,
        &format!(" command execution time histogram ({total} timed executions) "),
    );

    out.push('|');
    for bucket in first..=last {
        // Bucket k covers [10^k, 10^(k+1)) ns; label the upper bound.
        let upper = 10u64.saturating_pow(bucket as u32 + 1);
        out.push_str(&format!(" <{:>5} |", fmt_ns(upper)));
    }
    out.push_str("\n|");
    for bucket in first..=last {
        let count = g.histogram.bucket(bucket);
        if count != 0 {
            // Ceil to two decimals so tiny buckets stay visible.
            let share = (10_000.0 * count as f64 / total as f64).ceil() / 100.0;
            out.push_str(&format!("{share:>6}% |"));
        } else {
            out.push_str("        |");
        }
    }
    out.push('\n');
}

fn render_subtrees(out: &mut String, g: &Graph, opts: &ReportOptions, dts: f64) {
    rule(
        out,
        &format!(
            " top {} commands sorted by sum of subprocesses {} ",
            opts.top,
            opts.sort.label()
        ),
    );

    let key = |c: &CommandStats| match opts.sort {
        SortKey::Count => c.subtree_exec_count,
        SortKey::Time => c.subtree_exec_time_total,
    };
    let rows = g
        .commands()
        // Every process descends from init, so its row carries no signal.
        .filter(|c| !matches!(c.name.as_str(), "" | "init" | "systemd"))
        .filter(|c| c.subtree_exec_count != 0 && key(c) != 0);

    for cmd in rows.sorted_by(|a, b| key(b).cmp(&key(a))).take(opts.top) {
        let name = cmd.display_name();
        // Relative to all execs; rows do not sum to 100% because one exec is
        // credited to each of its ancestors.
        let pct = percent(cmd.subtree_exec_count, g.counters.exec_events);
        let rate = cmd.subtree_exec_count as f64 / dts;
        if opts.raw {
            out.push_str(&format!(
                "cp:{name}:{pct:.2}:{}:{rate:.2}\n",
                cmd.subtree_exec_count
            ));
        } else {
            out.push_str(&format!(
                "{name}: {pct:.2}% ({}) {rate:.2}e/s\n",
                cmd.subtree_exec_count
            ));
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Event;
    use crate::procfs::FakeProcReader;

    fn tracker_with(entries: &[(i32, &str, i32)]) -> Tracker {
        let mut reader = FakeProcReader::new();
        for &(pid, comm, ppid) in entries {
            reader.insert(pid, comm, ppid);
        }
        Tracker::with_reader(Box::new(reader))
    }

    fn exec(pid: i32, ts: u64) -> Event {
        Event::Exec {
            pid,
            timestamp_ns: ts,
            forks_seen: 0,
            exits_seen: 0,
        }
    }

    fn exit(pid: i32, ts: u64) -> Event {
        Event::Exit {
            pid,
            timestamp_ns: ts,
        }
    }

    fn render_with(t: &Tracker, opts: &ReportOptions) -> String {
        t.with_graph(|g| render(g, opts))
    }

    fn two_level_tracker() -> Tracker {
        let t = tracker_with(&[(1, "init", 0), (200, "bash", 1), (201, "awk", 200)]);
        t.handle_event(exec(200, 1_000_000_000));
        t.handle_event(exec(201, 2_000_000_000));
        t.handle_event(exit(201, 2_500_000_000));
        t.handle_event(exit(200, 3_000_000_000));
        t
    }

    #[test]
    fn test_raw_per_command_format() {
        let t = two_level_tracker();
        let opts = ReportOptions {
            raw: true,
            ..Default::default()
        };
        let text = render_with(&t, &opts);

        assert!(
            text.contains("pp:awk:50.00:1:"),
            "missing awk pp record in:\n{text}"
        );
        assert!(text.contains("pp:bash:50.00:1:"));
        // awk ran 500ms out of 2.5s total
        assert!(text.contains(":500ms:20.00\n"), "awk time share in:\n{text}");
        // histogram is suppressed in raw mode
        assert!(!text.contains("histogram"));
    }

    #[test]
    fn test_raw_subtree_format_and_exclusions() {
        let t = two_level_tracker();
        let opts = ReportOptions {
            raw: true,
            ..Default::default()
        };
        let text = render_with(&t, &opts);

        // one of two execs happened under bash
        assert!(
            text.contains("cp:bash:50.00:1:"),
            "missing bash cp record in:\n{text}"
        );
        // init is an ancestor of everything and is excluded
        assert!(!text.contains("cp:init"));
        assert!(!text.contains("cp:awk"));
    }

    #[test]
    fn test_human_report_sections() {
        let t = two_level_tracker();
        let text = render_with(&t, &ReportOptions::default());

        assert!(text.contains("total exec calls:   2"));
        assert!(text.contains("removed/vanished:   2/0"));
        assert!(text.contains("distinct commands:  3"));
        assert!(text.contains("top 10 commands sorted by number of exec"));
        assert!(text.contains("command execution time histogram (2 timed executions)"));
        assert!(text.contains("awk: 50.00% (1)"));
        assert!(text.contains("bash: 50.00% (1)"));
    }

    #[test]
    fn test_histogram_row_spans_nonempty_buckets() {
        let t = two_level_tracker();
        // durations: 500ms (bucket 8) and 1s (bucket 9)
        let text = render_with(&t, &ReportOptions::default());
        let labels = text
            .lines()
            .find(|l| l.starts_with("| <"))
            .expect("histogram label row");
        assert!(labels.contains("<   1s"));
        assert!(labels.contains("<  10s"));
        let shares = text
            .lines()
            .find(|l| l.contains("% |"))
            .expect("histogram share row");
        assert_eq!(shares.matches("50% |").count(), 2);
    }

    #[test]
    fn test_sort_by_time() {
        let t = tracker_with(&[(1, "init", 0), (300, "fast", 1), (301, "slow", 1)]);
        t.handle_event(exec(300, 1_000));
        t.handle_event(exec(300, 2_000)); // fast execs twice
        t.handle_event(exit(300, 3_000));
        t.handle_event(exec(301, 1_000));
        t.handle_event(exit(301, 5_000_000));

        let by_count = render_with(
            &t,
            &ReportOptions {
                sort: SortKey::Count,
                ..Default::default()
            },
        );
        let by_time = render_with(
            &t,
            &ReportOptions {
                sort: SortKey::Time,
                ..Default::default()
            },
        );

        let first_row = |text: &str| {
            text.lines()
                .skip_while(|l| !l.contains("commands sorted by"))
                .nth(1)
                .unwrap()
                .to_string()
        };
        assert!(first_row(&by_count).starts_with("fast:"));
        assert!(first_row(&by_time).starts_with("slow:"));
    }

    #[test]
    fn test_top_n_limits_rows() {
        let t = tracker_with(&[
            (1, "init", 0),
            (400, "a", 1),
            (401, "b", 1),
            (402, "c", 1),
        ]);
        t.handle_event(exec(400, 1_000));
        t.handle_event(exec(401, 1_000));
        t.handle_event(exec(402, 1_000));

        let opts = ReportOptions {
            top: 2,
            raw: true,
            ..Default::default()
        };
        let text = render_with(&t, &opts);
        assert_eq!(text.lines().filter(|l| l.starts_with("pp:")).count(), 2);
    }

    #[test]
    fn test_vanished_row_name() {
        let t = tracker_with(&[]);
        t.handle_event(exec(500, 1_000));
        let text = render_with(&t, &ReportOptions::default());
        assert!(text.contains("(vanished): 100.00% (1)"));
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        struct FailingWriter;
        impl Write for FailingWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("sink is gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let t = tracker_with(&[]);
        let reporter = Reporter::new(Box::new(FailingWriter), ReportOptions::default());
        reporter.emit(&t); // must not panic
    }

    #[test]
    fn test_reporter_writes_to_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.out");
        let file = std::fs::File::create(&path).unwrap();

        let t = two_level_tracker();
        let reporter = Reporter::new(Box::new(file), ReportOptions::default());
        reporter.emit(&t);
        reporter.note("Received SIGTERM. Exiting.");

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("total exec calls:   2"));
        assert!(written.ends_with("Received SIGTERM. Exiting.\n"));
    }
}
