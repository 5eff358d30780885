//! Rowflow CLI - run row pipelines over CSV files
//!
//! # Commands
//!
//! ```bash
//! rowflow parse input.csv                               # CSV rows as JSON lines
//! rowflow aggregate sales.csv --by city --sum amount    # Group-by aggregation
//! rowflow join left.csv right.csv --left-key id --right-key id --copy name
//! ```
//!
//! Every command writes JSON lines to stdout, or to `--output`. Settings
//! come from `--config file.json`, otherwise from `ROWFLOW_*` variables
//! (a `.env` file is loaded first).

use clap::{Args, Parser, Subcommand, ValueEnum};
use rowflow::{
    run_to_end, Aggregator, Avg, BatchedWriter, BoxedSequence, ColumnCopy, ContinuousAggregation, ContinuousGroupBy,
    Count, CsvOptions, CsvSource, DeferredMatch, DeferredOptions, EngineConfig, ExecutionContext, GroupBy,
    JsonLinesWriter, KeySelector, LinearRegression, LookupMatch, MatchAction, MatchKind, MatchRules, Max,
    Min, NoMatchAction, OrderedAggregation, PipelineFailure, SequenceExt, Sum, UnorderedAggregation,
    ValueKind, WriterOptions,
};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "rowflow")]
#[command(about = "Streaming row pipelines over CSV files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a CSV file and output its rows
    Parse {
        /// Input CSV file
        input: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Group rows by key columns and aggregate them
    Aggregate {
        /// Input CSV file
        input: PathBuf,

        /// Key columns, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        by: Vec<String>,

        /// Sum a column (into sum_<column>)
        #[arg(long)]
        sum: Vec<String>,

        /// Average a column (into avg_<column>)
        #[arg(long)]
        avg: Vec<String>,

        /// Smallest value of a column (into min_<column>)
        #[arg(long)]
        min: Vec<String>,

        /// Largest value of a column (into max_<column>)
        #[arg(long)]
        max: Vec<String>,

        /// Count rows per group (into count)
        #[arg(long)]
        count: bool,

        /// Fit y = slope * x + intercept, given as x,y
        #[arg(long)]
        regression: Vec<String>,

        /// Aggregation strategy
        #[arg(long, value_enum, default_value_t = Strategy::Unordered)]
        strategy: Strategy,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Match rows of a left CSV against a right CSV by key
    Join {
        /// Left CSV file
        left: PathBuf,

        /// Right CSV file
        right: PathBuf,

        /// Key column of the left file
        #[arg(long)]
        left_key: String,

        /// Key column of the right file
        #[arg(long)]
        right_key: String,

        /// Column copied from the right row, as from[:to]
        #[arg(long)]
        copy: Vec<String>,

        /// Matching shape
        #[arg(long, value_enum, default_value_t = Mode::Join)]
        mode: Mode,

        /// Left rows with a match
        #[arg(long, value_enum, default_value_t = Action::Keep)]
        on_match: Action,

        /// Left rows without a match
        #[arg(long, value_enum, default_value_t = Action::Keep)]
        no_match: Action,

        /// Resolve keys in batches instead of loading the right file up front
        #[arg(long)]
        deferred: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep rows whose column matches a regex, as column~regex
    #[arg(long)]
    filter: Vec<String>,

    /// Columns cast to double before processing, comma separated
    #[arg(long, value_delimiter = ',')]
    numeric: Vec<String>,

    /// CSV delimiter (auto-detect if not specified)
    #[arg(short, long)]
    delimiter: Option<char>,

    /// CSV encoding (auto-detect if not specified)
    #[arg(long)]
    encoding: Option<String>,

    /// Engine settings as JSON
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Strategy {
    Unordered,
    Ordered,
    Continuous,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Join,
    Expand,
    KeyTest,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Keep,
    Remove,
    Throw,
}

fn main() {
    // Load .env file (if present)
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Parse { input, common } => cmd_parse(&input, &common),

        Commands::Aggregate {
            input,
            by,
            sum,
            avg,
            min,
            max,
            count,
            regression,
            strategy,
            common,
        } => {
            let aggregators = build_aggregators(&sum, &avg, &min, &max, count, &regression);
            aggregators.and_then(|aggregators| cmd_aggregate(&input, &by, aggregators, strategy, &common))
        }

        Commands::Join {
            left,
            right,
            left_key,
            right_key,
            copy,
            mode,
            on_match,
            no_match,
            deferred,
            common,
        } => {
            let rules = build_rules(&copy, on_match, no_match);
            let options = JoinOptions {
                left_key,
                right_key,
                mode,
                deferred,
            };
            cmd_join(&left, &right, &options, rules, &common)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(common: &CommonArgs) -> CliResult<EngineConfig> {
    let config = match &common.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

fn csv_options(common: &CommonArgs) -> CsvOptions {
    CsvOptions {
        encoding: common.encoding.clone(),
        delimiter: common.delimiter,
    }
}

/// CSV source followed by the `--filter` and `--numeric` stages.
fn open_input(ctx: &Arc<ExecutionContext>, path: &Path, common: &CommonArgs) -> CliResult<BoxedSequence> {
    let source = CsvSource::open(ctx, path, csv_options(common))?;
    eprintln!("Reading: {}", path.display());
    eprintln!("   Encoding: {}", source.encoding());
    eprintln!("   Delimiter: '{}'", format_delimiter(source.delimiter()));
    eprintln!("   Columns: {}", source.headers().join(", "));

    let mut sequence = source.boxed();
    for filter in &common.filter {
        let (column, pattern) = filter
            .split_once('~')
            .ok_or_else(|| format!("filter '{}' is not of the form column~regex", filter))?;
        sequence = sequence.filter_matching(ctx, column, pattern)?.boxed();
    }
    if !common.numeric.is_empty() {
        let columns: Vec<&str> = common.numeric.iter().map(String::as_str).collect();
        sequence = sequence.convert_columns(ctx, &columns, ValueKind::Double).boxed();
    }
    Ok(sequence)
}

fn format_delimiter(d: char) -> String {
    match d {
        '\t' => "\\t".to_string(),
        c => c.to_string(),
    }
}

/// Writes every row of `sequence` as JSON lines and reports the outcome.
fn run_pipeline(ctx: &Arc<ExecutionContext>, sequence: BoxedSequence, output: Option<&Path>) -> CliResult<()> {
    let options = WriterOptions::from_config(ctx.config());
    let mut writer = match output {
        Some(path) => {
            let out: Box<dyn Write + Send> = Box::new(BufWriter::new(File::create(path)?));
            BatchedWriter::new(ctx, sequence, JsonLinesWriter::new(out), "file", &path.to_string_lossy(), options)
        }
        None => {
            let out: Box<dyn Write + Send> = Box::new(std::io::stdout());
            BatchedWriter::new(ctx, sequence, JsonLinesWriter::new(out), "stdout", "-", options)
        }
    };

    match run_to_end(ctx, &mut writer) {
        Ok(count) => {
            let stats = ctx.io_stats();
            eprintln!("Done: {} row(s) written in {} batch(es)", count, stats.succeeded);
            Ok(())
        }
        Err(failure) => {
            report(&failure);
            std::process::exit(1);
        }
    }
}

fn report(failure: &PipelineFailure) {
    eprintln!("Pipeline aborted with {} error(s):", failure.errors.len());
    for err in &failure.errors {
        eprintln!("   - {}", err);
    }
}

fn cmd_parse(input: &Path, common: &CommonArgs) -> CliResult<()> {
    let ctx = ExecutionContext::new(load_config(common)?);
    let sequence = open_input(&ctx, input, common)?;
    run_pipeline(&ctx, sequence, common.output.as_deref())
}

fn build_aggregators(
    sum: &[String],
    avg: &[String],
    min: &[String],
    max: &[String],
    count: bool,
    regression: &[String],
) -> CliResult<Vec<Box<dyn Aggregator>>> {
    let mut aggregators: Vec<Box<dyn Aggregator>> = Vec::new();
    for column in sum {
        aggregators.push(Box::new(Sum::new(column).into_column(&format!("sum_{}", column))));
    }
    for column in avg {
        aggregators.push(Box::new(Avg::new(column).into_column(&format!("avg_{}", column))));
    }
    for column in min {
        aggregators.push(Box::new(Min::new(column).into_column(&format!("min_{}", column))));
    }
    for column in max {
        aggregators.push(Box::new(Max::new(column).into_column(&format!("max_{}", column))));
    }
    if count {
        aggregators.push(Box::new(Count::rows("count")));
    }
    for pair in regression {
        let (x, y) = pair
            .split_once(',')
            .ok_or_else(|| format!("regression '{}' is not of the form x,y", pair))?;
        aggregators.push(Box::new(LinearRegression::new(x.trim(), y.trim())));
    }
    if aggregators.is_empty() {
        return Err("no aggregator given (use --sum, --avg, --min, --max, --count or --regression)".into());
    }
    Ok(aggregators)
}

fn cmd_aggregate(
    input: &Path,
    by: &[String],
    aggregators: Vec<Box<dyn Aggregator>>,
    strategy: Strategy,
    common: &CommonArgs,
) -> CliResult<()> {
    let ctx = ExecutionContext::new(load_config(common)?);
    let sequence = open_input(&ctx, input, common)?;
    let keys: Vec<&str> = by.iter().map(String::as_str).collect();

    let aggregated = match strategy {
        Strategy::Unordered | Strategy::Ordered => {
            let mut transform = GroupBy::new(&keys);
            for aggregator in aggregators {
                transform.push(aggregator);
            }
            match strategy {
                Strategy::Ordered => OrderedAggregation::new(&ctx, sequence, &keys, transform).boxed(),
                _ => UnorderedAggregation::new(&ctx, sequence, &keys, transform).boxed(),
            }
        }
        Strategy::Continuous => {
            let mut operation = ContinuousGroupBy::new(&keys);
            for aggregator in aggregators {
                operation.push(aggregator);
            }
            ContinuousAggregation::new(&ctx, sequence, &keys, operation).boxed()
        }
    };
    run_pipeline(&ctx, aggregated, common.output.as_deref())
}

struct JoinOptions {
    left_key: String,
    right_key: String,
    mode: Mode,
    deferred: bool,
}

fn build_rules(copies: &[String], on_match: Action, no_match: Action) -> MatchRules {
    let mut rules = MatchRules::new().copies(copies.iter().map(|c| ColumnCopy::parse(c)));
    match on_match {
        Action::Keep => {}
        Action::Remove => rules = rules.on_match(MatchAction::Remove),
        Action::Throw => rules = rules.on_match(MatchAction::Throw),
    }
    match no_match {
        Action::Keep => {}
        Action::Remove => rules = rules.on_no_match(NoMatchAction::Remove),
        Action::Throw => rules = rules.on_no_match(NoMatchAction::Throw),
    }
    rules
}

fn cmd_join(
    left: &Path,
    right: &Path,
    options: &JoinOptions,
    rules: MatchRules,
    common: &CommonArgs,
) -> CliResult<()> {
    let ctx = ExecutionContext::new(load_config(common)?);
    let left_seq = open_input(&ctx, left, common)?;
    let left_key = KeySelector::columns(&[options.left_key.as_str()]);
    let right_key = KeySelector::columns(&[options.right_key.as_str()]);
    let kind = match options.mode {
        Mode::Join => MatchKind::Join,
        Mode::Expand => MatchKind::Expand,
        Mode::KeyTest => MatchKind::KeyTest,
    };

    let matched = if options.deferred {
        let right_path = right.to_path_buf();
        let csv = csv_options(common);
        let selector = right_key.clone();
        // Each batch rescans the right file, keeping only the requested keys.
        let provider = move |ctx: &Arc<ExecutionContext>, keys: &[String]| -> Result<BoxedSequence, rowflow::BoxError> {
            let wanted: HashSet<String> = keys.iter().cloned().collect();
            let selector = selector.clone();
            let source = CsvSource::open(ctx, &right_path, csv.clone())?;
            let filtered = source.filter(ctx, move |row| {
                matches!(selector.key(row), Ok(Some(key)) if wanted.contains(&key))
            });
            Ok(filtered.boxed())
        };
        let deferred_options = DeferredOptions::from_config(ctx.config());
        DeferredMatch::new(&ctx, kind, left_seq, left_key, right_key, provider, rules, deferred_options)?.boxed()
    } else {
        let right_seq = open_input(&ctx, right, common)?;
        match kind {
            MatchKind::Join => LookupMatch::join(&ctx, left_seq, right_seq, left_key, right_key, rules)?.boxed(),
            MatchKind::Expand => LookupMatch::expand(&ctx, left_seq, right_seq, left_key, right_key, rules)?.boxed(),
            MatchKind::KeyTest => {
                LookupMatch::key_test(&ctx, left_seq, right_seq, left_key, right_key, rules)?.boxed()
            }
        }
    };
    run_pipeline(&ctx, matched, common.output.as_deref())
}
