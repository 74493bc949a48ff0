use crate::config::Settings;
use crate::ingest::{Resolution, Resolver, Unmatched};
use crate::timeutil::{DEFAULT_TOLERANCE_SECS, format_offset};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Suggestions shown per unmatched file.
const MAX_SUGGESTIONS: usize = 8;

#[derive(Parser, Debug)]
#[command(
    name = "stridelog",
    about = "Import foot-pod sensor CSVs into SQLite, named after the matching watch activity"
)]
pub struct Cli {
    /// SQLite database file. Default: <config dir>/stridelog/runs.db
    #[arg(long, value_name = "PATH", global = true)]
    pub db: Option<PathBuf>,

    /// Timezone the activity log was written in (IANA name). Default: host zone.
    #[arg(long, value_name = "ZONE", global = true)]
    pub tz: Option<String>,

    /// Max seconds between sensor start and activity start.
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_TOLERANCE_SECS, global = true)]
    pub tolerance: i64,

    /// Save the paths and timezone given on this run as the new defaults.
    #[arg(long, global = true)]
    pub remember: bool,

    /// Increase log verbosity (-v, -vv). Defaults to INFO.
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Decrease log verbosity (-q, -qq). Defaults to INFO.
    #[arg(short = 'q', long, action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Import every sensor CSV in a directory (or .zip); unmatched files are skipped.
    Import {
        /// Sensor export directory or ZIP. Default: remembered value.
        #[arg(value_name = "SOURCE")]
        source: Option<PathBuf>,

        /// Watch activity log CSV. Default: remembered value.
        #[arg(long, value_name = "CSV")]
        activities: Option<PathBuf>,
    },

    /// Import a single sensor CSV.
    File {
        path: PathBuf,

        #[arg(long, value_name = "CSV")]
        activities: Option<PathBuf>,

        /// Store the run as "Unknown" if no activity matches, instead of asking.
        #[arg(long)]
        insert_unmatched: bool,
    },

    /// List sensor files whose run is not in the database yet.
    Unparsed {
        #[arg(value_name = "SOURCE")]
        source: Option<PathBuf>,

        #[arg(long, value_name = "CSV")]
        activities: Option<PathBuf>,

        /// Walk through the unparsed files and import them interactively.
        #[arg(long)]
        reconcile: bool,
    },

    /// List stored runs, oldest first.
    Runs {
        /// First day (UTC), YYYY-MM-DD.
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last day (UTC), YYYY-MM-DD.
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Match workout name or type.
        #[arg(long, short = 'k')]
        keyword: Option<String>,

        /// Show only this page (1-based).
        #[arg(long)]
        page: Option<usize>,

        #[arg(long, default_value_t = crate::query::DEFAULT_PAGE_SIZE)]
        page_size: usize,

        /// Show one run with its sample averages.
        #[arg(long, conflicts_with_all = ["from", "to", "keyword", "page"])]
        id: Option<i64>,
    },

    /// Weekly totals, or one total for the whole window.
    Report {
        #[arg(long, value_enum, default_value_t = WindowKind::Calendar)]
        window: WindowKind,

        #[arg(long, default_value_t = 4)]
        weeks: u32,

        /// Day the window is anchored to. Default: today.
        #[arg(long)]
        anchor: Option<NaiveDate>,

        /// Custom window start (inclusive).
        #[arg(long, required_if_eq("window", "custom"))]
        from: Option<NaiveDate>,

        /// Custom window end (inclusive).
        #[arg(long, required_if_eq("window", "custom"))]
        to: Option<NaiveDate>,

        /// One line for the whole window instead of one per week.
        #[arg(long)]
        summary: bool,
    },

    /// Delete every run, workout and sample.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowKind {
    Calendar,
    Rolling,
    Custom,
}

impl Cli {
    /// Settings given on the command line; unset fields fall back to saved ones.
    pub fn settings(&self) -> Settings {
        let (sensor_dir, activity_file) = match &self.cmd {
            Cmd::Import { source, activities } | Cmd::Unparsed {
                source, activities, ..
            } => (source.clone(), activities.clone()),
            Cmd::File { activities, .. } => (None, activities.clone()),
            _ => (None, None),
        };
        Settings {
            sensor_dir,
            activity_file,
            timezone: self.tz.clone(),
            database: self.db.clone(),
        }
    }
}

/// Asks on a terminal what to do with each unmatched file.
///
/// Empty answer or `s` skips, `i` inserts as "Unknown", `q` quits, a number
/// picks a suggested zone, anything else is tried as a zone name.
pub struct PromptResolver<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptResolver<R, W> {
    pub const fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, ctx: &Unmatched<'_>, suggestions: &[String]) -> std::io::Result<String> {
        let out = &mut self.output;
        writeln!(out)?;
        writeln!(out, "No activity match for {} (read as {})", ctx.file, ctx.tz_name)?;
        writeln!(out, "  sensor start (UTC): {}", ctx.no_match.sensor_utc)?;
        match &ctx.no_match.nearest {
            Some(n) => {
                writeln!(out, "  nearest activity:   {}", n.activity_utc)?;
                writeln!(out, "  difference:         {}", format_offset(n.delta))?;
            }
            None => writeln!(out, "  activity log has no usable dates")?,
        }
        for (i, tz) in suggestions.iter().enumerate() {
            writeln!(out, "  [{}] {tz}", i + 1)?;
        }
        write!(out, "[i]nsert, [s]kip, [q]uit, or timezone: ")?;
        out.flush()?;

        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl<R: BufRead, W: Write> Resolver for PromptResolver<R, W> {
    fn on_no_match(&mut self, ctx: &Unmatched<'_>) -> Resolution {
        let mut suggestions = ctx.suggested_timezones();
        suggestions.truncate(MAX_SUGGESTIONS);

        let answer = match self.ask(ctx, &suggestions) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(err = %e, "prompt failed, quitting");
                return Resolution::Quit;
            }
        };
        parse_answer(&answer, &suggestions)
    }
}

fn parse_answer(answer: &str, suggestions: &[String]) -> Resolution {
    match answer.to_ascii_lowercase().as_str() {
        "" | "s" | "skip" => Resolution::Skip,
        "i" | "insert" => Resolution::InsertUnmatched,
        "q" | "quit" => Resolution::Quit,
        _ => match answer.parse::<usize>() {
            Ok(n) if (1..=suggestions.len()).contains(&n) => {
                Resolution::RetryTimezone(suggestions[n - 1].clone())
            }
            _ => Resolution::RetryTimezone(answer.to_string()),
        },
    }
}

/// Ask for the reset confirmation word.
pub fn confirm_reset<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> std::io::Result<String> {
    write!(output, "This deletes all runs. Type 'yes' to continue: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers() {
        let sugg = vec!["Europe/Athens".to_string(), "Africa/Cairo".to_string()];
        assert_eq!(parse_answer("", &sugg), Resolution::Skip);
        assert_eq!(parse_answer("I", &sugg), Resolution::InsertUnmatched);
        assert_eq!(parse_answer("quit", &sugg), Resolution::Quit);
        assert_eq!(
            parse_answer("2", &sugg),
            Resolution::RetryTimezone("Africa/Cairo".into())
        );
        assert_eq!(
            parse_answer("9", &sugg),
            Resolution::RetryTimezone("9".into())
        );
        assert_eq!(
            parse_answer("Asia/Tokyo", &sugg),
            Resolution::RetryTimezone("Asia/Tokyo".into())
        );
    }

    #[test]
    fn flags_become_settings() {
        let cli = Cli::parse_from([
            "stridelog",
            "--tz",
            "Europe/Athens",
            "import",
            "/data/stryd",
            "--activities",
            "/data/Activities.csv",
        ]);
        let s = cli.settings();
        assert_eq!(s.sensor_dir, Some(PathBuf::from("/data/stryd")));
        assert_eq!(s.activity_file, Some(PathBuf::from("/data/Activities.csv")));
        assert_eq!(s.timezone.as_deref(), Some("Europe/Athens"));
        assert_eq!(cli.tolerance, DEFAULT_TOLERANCE_SECS);
    }

    #[test]
    fn custom_report_needs_dates() {
        assert!(Cli::try_parse_from(["stridelog", "report", "--window", "custom"]).is_err());
        assert!(
            Cli::try_parse_from([
                "stridelog",
                "report",
                "--window",
                "custom",
                "--from",
                "2024-06-01",
                "--to",
                "2024-06-30"
            ])
            .is_ok()
        );
    }

    #[test]
    fn reset_prompt_reads_a_line() {
        let mut input = std::io::Cursor::new(b"yes\n".to_vec());
        let mut out = Vec::new();
        let answer = confirm_reset(&mut input, &mut out).unwrap();
        assert_eq!(answer.trim(), "yes");
        assert!(String::from_utf8(out).unwrap().contains("Type 'yes'"));
    }
}
