//! Command surface for the `demere` binary.
//!
//! - [`run_cli`] opens the configured store, loads the run history and executes
//!   one parsed command.
//! - [`run_command`] executes a command against an already loaded [`RunLedger`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use demere_core::{
    format_rfc3339, simulate, GameMode, KeyValueStore, MemoryStore, ModeSummary, RngDice,
    RunEntry, RunLedger, TrialReport, TrialResult, EXPORT_FILENAME, STORAGE_KEY,
};
use demere_store_sqlite::SqliteKvStore;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const RUN_CONTRACT_VERSION: &str = "run_report.v1";
const HISTORY_CONTRACT_VERSION: &str = "run_history.v1";
const STATS_CONTRACT_VERSION: &str = "mode_summary.v1";

/// Upper bound for `run --count`. Every trial rewrites the stored history.
pub const MAX_TRIALS_PER_RUN: usize = 10_000;

#[derive(Debug, Parser)]
#[command(name = "demere")]
#[command(about = "De Méré dice problem simulator")]
pub struct Cli {
    #[arg(long, env = "DEMERE_DB", default_value = "./demere.sqlite3", global = true)]
    db: PathBuf,

    #[arg(long, default_value = STORAGE_KEY, global = true)]
    storage_key: String,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn verbosity(&self) -> u8 {
        self.verbose
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Simulate trials and record them.
    Run(RunArgs),
    /// List recorded trials.
    History(HistoryArgs),
    /// Compare observed frequencies with the theoretical probabilities.
    Stats(StatsArgs),
    /// Write the run history as CSV.
    Export(ExportArgs),
    /// Delete the run history.
    Clear,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, value_enum, default_value_t = ModeArg::OneDie)]
    mode: ModeArg,
    #[arg(long, default_value_t = 1, value_parser = parse_count)]
    count: usize,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    rolls: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long, default_value = EXPORT_FILENAME)]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
    OneDie,
    TwoDice,
}

/// Installs the stderr log subscriber. `DEMERE_LOG` overrides the level
/// picked from `verbosity`.
pub fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("DEMERE_LOG")
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Executes the parsed CLI against the configured store.
///
/// # Errors
/// Returns an error when the requested command fails. Storage problems are
/// reported as warnings and never fail the command on their own.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut ledger = open_ledger(&cli.db, &cli.storage_key);
    ledger.load();
    report_warnings(&mut ledger);

    let result = run_command(cli.command, &mut ledger);
    report_warnings(&mut ledger);
    result
}

/// Opens the `SQLite` store at `db_path`, falling back to an in-memory store
/// when the file cannot be used.
#[must_use]
pub fn open_ledger(db_path: &Path, storage_key: &str) -> RunLedger<Box<dyn KeyValueStore>> {
    let store: Box<dyn KeyValueStore> = match SqliteKvStore::open_migrated(db_path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            tracing::warn!(
                db = %db_path.display(),
                "persistent store unavailable, history will not be saved: {err:#}"
            );
            Box::new(MemoryStore::default())
        }
    };
    RunLedger::with_key(store, storage_key)
}

/// Executes one command against a loaded ledger.
///
/// # Errors
/// Returns an error when output cannot be serialized or the export file
/// cannot be written.
pub fn run_command<S: KeyValueStore>(command: Command, ledger: &mut RunLedger<S>) -> Result<()> {
    match command {
        Command::Run(args) => run_trials(&args, ledger),
        Command::History(args) => {
            let entries = tail(ledger.entries(), args.limit);
            if args.json {
                let payload = HistoryJsonPayload {
                    contract_version: HISTORY_CONTRACT_VERSION,
                    total: ledger.len(),
                    entries,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print!("{}", render_history(entries, args.rolls)?);
            }
            Ok(())
        }
        Command::Stats(args) => {
            let summary = ledger.summary();
            if args.json {
                let payload = StatsJsonPayload {
                    contract_version: STATS_CONTRACT_VERSION,
                    modes: summary,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print!("{}", render_stats(&summary));
            }
            Ok(())
        }
        Command::Export(args) => {
            if export_table(ledger, &args.output)? {
                println!("exported {} runs to {}", ledger.len(), args.output.display());
            } else {
                println!("no runs recorded yet; run a simulation before exporting");
            }
            Ok(())
        }
        Command::Clear => {
            let dropped = ledger.len();
            ledger.clear();
            println!("run history cleared ({dropped} runs removed)");
            Ok(())
        }
    }
}

/// Writes the CSV export to `path`. Returns `false` without touching the
/// filesystem when there is nothing to export.
///
/// # Errors
/// Returns an error when the table cannot be rendered or written.
pub fn export_table<S: KeyValueStore>(ledger: &RunLedger<S>, path: &Path) -> Result<bool> {
    if ledger.is_empty() {
        return Ok(false);
    }

    let table = ledger
        .to_table()
        .map_err(|err| anyhow!("failed to render run history: {err}"))?;
    std::fs::write(path, table)
        .with_context(|| format!("failed writing CSV export to {}", path.display()))?;
    Ok(true)
}

fn run_trials<S: KeyValueStore>(args: &RunArgs, ledger: &mut RunLedger<S>) -> Result<()> {
    let mode = map_mode(args.mode);
    let mut dice = match args.seed {
        Some(seed) => RngDice::seeded(seed),
        None => RngDice::from_entropy(),
    };

    let mut runs = Vec::new();
    for index in 0..args.count {
        let result = simulate(mode, &mut dice);
        let entry = ledger
            .append(&result)
            .map_err(|err| anyhow!("failed to record trial: {err}"))?;

        if args.json {
            runs.push(RunJsonPayload {
                trial_id: entry.trial_id(),
                timestamp: format_rfc3339(entry.timestamp())
                    .map_err(|err| anyhow!(err.to_string()))?,
                report: result.report(),
            });
        } else {
            if index > 0 {
                println!();
            }
            print!("{}", render_trial(entry.trial_id(), &result));
        }
    }

    if args.json {
        let payload = RunsJsonPayload {
            contract_version: RUN_CONTRACT_VERSION,
            runs,
        };
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("saved runs: {}", ledger.len());
    }

    Ok(())
}

/// Roll log followed by the KPI line for one trial.
#[must_use]
pub fn render_trial(trial_id: u32, result: &TrialResult) -> String {
    let mut lines = vec![format!(
        "trial {trial_id} ({}, {} rolls)",
        result.mode(),
        result.roll_count()
    )];
    lines.extend(result.rolls().iter().map(ToString::to_string));
    lines.push(format!(
        "theoretical={:.4} successes={} status={} rolls={}",
        result.theoretical_probability(),
        result.success_count(),
        if result.occurred() {
            "occurred"
        } else {
            "did-not-occur"
        },
        result.roll_count()
    ));
    finish_lines(&lines)
}

/// Plain-text history table.
///
/// # Errors
/// Returns an error when a timestamp cannot be formatted.
pub fn render_history(entries: &[RunEntry], with_rolls: bool) -> Result<String> {
    let mut lines = vec![
        format!(
            "{:<8} {:<9} {:<32} {:<6} {:<9} occurred",
            "trial_id", "game", "timestamp", "rolls", "successes"
        ),
        "-".repeat(80),
    ];

    for entry in entries {
        let timestamp =
            format_rfc3339(entry.timestamp()).map_err(|err| anyhow!(err.to_string()))?;
        lines.push(format!(
            "{:<8} {:<9} {:<32} {:<6} {:<9} {}",
            entry.trial_id(),
            entry.game().as_str(),
            timestamp,
            entry.roll_count(),
            entry.success_count(),
            if entry.occurred() { "yes" } else { "no" }
        ));

        if with_rolls {
            match TrialResult::from_rolls_json(entry.game(), entry.roll_detail()) {
                Ok(result) => {
                    let rolls = result
                        .rolls()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>();
                    lines.push(format!("    {}", rolls.join("  ")));
                }
                Err(err) => lines.push(format!("    (unreadable roll detail: {err})")),
            }
        }
    }

    Ok(finish_lines(&lines))
}

#[must_use]
pub fn render_stats(summary: &[ModeSummary]) -> String {
    let mut lines = vec![
        format!(
            "{:<9} {:<7} {:<9} {:<10} {:<12} delta",
            "mode", "trials", "occurred", "empirical", "theoretical"
        ),
        "-".repeat(60),
    ];

    for item in summary {
        let (empirical, delta) = match item.empirical_rate {
            Some(rate) => (
                format!("{rate:.4}"),
                format!("{:+.4}", rate - item.theoretical_probability),
            ),
            None => ("n/a".to_string(), "n/a".to_string()),
        };
        lines.push(format!(
            "{:<9} {:<7} {:<9} {:<10} {:<12.4} {}",
            item.mode.as_str(),
            item.trials,
            item.occurred,
            empirical,
            item.theoretical_probability,
            delta
        ));
    }

    finish_lines(&lines)
}

fn finish_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn report_warnings<S: KeyValueStore>(ledger: &mut RunLedger<S>) {
    for warning in ledger.take_warnings() {
        if warning.is_degraded() {
            tracing::warn!("{warning}");
        } else {
            tracing::info!("{warning}");
        }
    }
}

fn tail(entries: &[RunEntry], limit: Option<usize>) -> &[RunEntry] {
    match limit {
        Some(limit) if limit < entries.len() => &entries[entries.len() - limit..],
        _ => entries,
    }
}

fn map_mode(value: ModeArg) -> GameMode {
    match value {
        ModeArg::OneDie => GameMode::OneDie,
        ModeArg::TwoDice => GameMode::TwoDice,
    }
}

fn parse_count(raw: &str) -> std::result::Result<usize, String> {
    let count: usize = raw
        .parse()
        .map_err(|err| format!("count must be a positive integer: {err}"))?;
    if !(1..=MAX_TRIALS_PER_RUN).contains(&count) {
        return Err(format!("count must be between 1 and {MAX_TRIALS_PER_RUN}"));
    }
    Ok(count)
}

#[derive(Debug, Serialize)]
struct RunJsonPayload {
    trial_id: u32,
    timestamp: String,
    #[serde(flatten)]
    report: TrialReport,
}

#[derive(Debug, Serialize)]
struct RunsJsonPayload {
    contract_version: &'static str,
    runs: Vec<RunJsonPayload>,
}

#[derive(Debug, Serialize)]
struct HistoryJsonPayload<'a> {
    contract_version: &'static str,
    total: usize,
    entries: &'a [RunEntry],
}

#[derive(Debug, Serialize)]
struct StatsJsonPayload {
    contract_version: &'static str,
    modes: Vec<ModeSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use demere_core::{DieSource, LedgerState};
    use std::fs;

    struct FixedFaces(Vec<u8>, usize);

    impl DieSource for FixedFaces {
        fn roll_face(&mut self) -> u8 {
            let face = self.0[self.1 % self.0.len()];
            self.1 += 1;
            face
        }
    }

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn record<S: KeyValueStore>(ledger: &mut RunLedger<S>, result: &TrialResult) -> RunEntry {
        must(ledger.append(result).map_err(Into::into))
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    fn temp_path(label: &str, extension: &str) -> PathBuf {
        std::env::temp_dir().join(format!("demere-{label}-{}.{extension}", ulid::Ulid::new()))
    }

    #[test]
    fn run_defaults_to_one_die_single_trial() {
        let cli = parse(&["demere", "run"]);
        match cli.command {
            Command::Run(args) => {
                assert!(matches!(args.mode, ModeArg::OneDie));
                assert_eq!(args.count, 1);
                assert_eq!(args.seed, None);
            }
            other => panic!("expected run command, got {other:?}"),
        }
        assert_eq!(cli.storage_key, STORAGE_KEY);
    }

    #[test]
    fn unknown_mode_is_rejected_before_simulation() {
        assert!(Cli::try_parse_from(["demere", "run", "--mode", "three-dice"]).is_err());
        assert!(Cli::try_parse_from(["demere", "run", "--count", "0"]).is_err());
    }

    #[test]
    fn run_count_is_bounded() {
        let max = MAX_TRIALS_PER_RUN.to_string();
        match parse(&["demere", "run", "--count", &max]).command {
            Command::Run(args) => assert_eq!(args.count, MAX_TRIALS_PER_RUN),
            other => panic!("expected run command, got {other:?}"),
        }

        let over = (MAX_TRIALS_PER_RUN + 1).to_string();
        for raw in [over.as_str(), "18446744073709551615", "99999999999999999999999"] {
            let parsed = Cli::try_parse_from(["demere", "run", "--count", raw, "--seed", "1"]);
            let err = match parsed {
                Ok(cli) => panic!("accepted --count {raw}: {cli:?}"),
                Err(err) => err,
            };
            assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        }
    }

    #[test]
    fn unopenable_database_falls_back_to_memory() {
        let dir = temp_path("not-a-db", "d");
        must(fs::create_dir_all(&dir).map_err(Into::into));

        let mut ledger = open_ledger(&dir, STORAGE_KEY);
        assert_eq!(ledger.load(), 0);
        let result = simulate(GameMode::OneDie, &mut FixedFaces(vec![6], 0));
        let entry = record(&mut ledger, &result);
        assert_eq!(entry.trial_id(), 1);
        assert!(ledger.take_warnings().iter().all(|warning| !warning.is_degraded()));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn render_trial_lists_rolls_and_kpis() {
        let result = simulate(GameMode::TwoDice, &mut FixedFaces(vec![6], 0));
        let rendered = render_trial(3, &result);
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines[0], "trial 3 (two_dice, 24 rolls)");
        assert_eq!(lines[1], "#1: (6, 6)");
        assert_eq!(lines.len(), 26);
        assert_eq!(
            lines[25],
            "theoretical=0.4914 successes=24 status=occurred rolls=24"
        );
    }

    #[test]
    fn history_tail_respects_limit() {
        let mut ledger = RunLedger::new(MemoryStore::default());
        let mut dice = RngDice::seeded(2);
        for _ in 0..5 {
            record(&mut ledger, &simulate(GameMode::OneDie, &mut dice));
        }

        let last_two = tail(ledger.entries(), Some(2));
        assert_eq!(
            last_two.iter().map(RunEntry::trial_id).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(tail(ledger.entries(), Some(10)).len(), 5);

        let rendered = must(render_history(last_two, true));
        assert_eq!(rendered.lines().count(), 2 + 2 * 2);
        assert!(rendered.contains("#1: "));
    }

    #[test]
    fn stats_render_marks_missing_modes() {
        let mut ledger = RunLedger::new(MemoryStore::default());
        record(&mut ledger, &simulate(GameMode::OneDie, &mut FixedFaces(vec![6], 0)));

        let rendered = render_stats(&ledger.summary());
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[2].starts_with("one_die   1       1         1.0000"));
        assert!(lines[2].ends_with("+0.4823"));
        assert!(lines[3].starts_with("two_dice  0       0         n/a"));
    }

    #[test]
    fn export_skips_empty_ledger_and_writes_csv_otherwise() {
        let path = temp_path("export", "csv");
        let mut ledger = RunLedger::new(MemoryStore::default());

        assert!(!must(export_table(&ledger, &path)));
        assert!(!path.exists());

        record(&mut ledger, &simulate(GameMode::OneDie, &mut FixedFaces(vec![6], 0)));
        assert!(must(export_table(&ledger, &path)));

        let text = must(fs::read_to_string(&path).map_err(Into::into));
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("trial_id,game,timestamp,n_lanzamientos,exitos,ocurrio,detalles_json")
        );
        assert!(lines.next().is_some_and(|row| row.starts_with("1,one_die,")));
        assert_eq!(lines.next(), None);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn clear_command_empties_ledger() {
        let mut ledger = RunLedger::new(MemoryStore::default());
        record(&mut ledger, &simulate(GameMode::OneDie, &mut FixedFaces(vec![2], 0)));

        must(run_command(Command::Clear, &mut ledger));
        assert_eq!(ledger.state(), LedgerState::Empty);
    }

    #[test]
    fn cli_end_to_end_run_history_and_reload() {
        let db_path = temp_path("cli-e2e", "sqlite3");
        let db = match db_path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };

        must(run_cli(parse(&[
            "demere", "--db", &db, "run", "--mode", "two-dice", "--count", "3", "--seed", "8",
        ])));
        must(run_cli(parse(&["demere", "--db", &db, "run", "--seed", "9"])));
        must(run_cli(parse(&["demere", "--db", &db, "history", "--json"])));

        let mut ledger = open_ledger(&db_path, STORAGE_KEY);
        assert_eq!(ledger.load(), 4);
        let modes: Vec<GameMode> = ledger.entries().iter().map(RunEntry::game).collect();
        assert_eq!(
            modes,
            vec![
                GameMode::TwoDice,
                GameMode::TwoDice,
                GameMode::TwoDice,
                GameMode::OneDie
            ]
        );

        must(run_cli(parse(&["demere", "--db", &db, "clear"])));
        let mut cleared = open_ledger(&db_path, STORAGE_KEY);
        assert_eq!(cleared.load(), 0);

        let _ = fs::remove_file(&db_path);
    }
}
