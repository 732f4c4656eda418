//! Command-line interface for percentile forward mapping.

use fwdmap::accuracy::AccuracyEvaluator;
use fwdmap::backtest::RollingBacktest;
use fwdmap::bins::PercentileBins;
use fwdmap::config::{ForecastConfig, ForecastFileConfig};
use fwdmap::data::{load_csv, DataConfig};
use fwdmap::dataset::{Dataset, DatasetBuilder};
use fwdmap::ensemble::ForwardMapper;
use fwdmap::error::{ForecastError, Result};
use fwdmap::kernel::KernelBandwidth;
use fwdmap::report::ReportFormatter;
use fwdmap::types::{BarDuration, ModelKind};

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// fwdmap - forward return forecasts conditioned on oscillator percentile rank.
#[derive(Parser)]
#[command(name = "fwdmap")]
#[command(version)]
#[command(about = "Percentile forward mapping with rolling out-of-sample validation")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by the analysis commands. Command-line values override the
/// configuration file.
#[derive(clap::Args, Debug, Clone)]
pub struct InputArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// CSV with timestamp, price and percentile columns
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Instrument name
    #[arg(short, long)]
    pub instrument: Option<String>,

    /// Forward horizons in bars, e.g. 1,5,10,20
    #[arg(short = 'H', long, value_delimiter = ',')]
    pub horizons: Option<Vec<usize>>,

    /// Bar duration of the input series, e.g. 1d, 4h, 15m
    #[arg(short, long)]
    pub bar_duration: Option<BarDuration>,

    /// Kernel bandwidth in percentile points, or "auto"
    #[arg(long)]
    pub bandwidth: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Forecast forward returns for the latest percentile
    Analyze {
        #[command(flatten)]
        input: InputArgs,

        /// Forecast this percentile instead of the latest one
        #[arg(short, long)]
        percentile: Option<f64>,

        /// Also run a rolling backtest and attach its accuracy
        #[arg(long)]
        with_backtest: bool,

        /// Print transition matrices
        #[arg(long)]
        matrices: bool,
    },

    /// Run a rolling-window out-of-sample backtest
    Backtest {
        #[command(flatten)]
        input: InputArgs,

        /// Training window length in observations
        #[arg(long)]
        train: Option<usize>,

        /// Test window length in observations
        #[arg(long)]
        test: Option<usize>,

        /// Window step (defaults to the test length)
        #[arg(long)]
        step: Option<usize>,

        /// Keep training rows whose labels overlap the test window
        #[arg(long)]
        no_purge: bool,

        /// Evaluate windows in parallel
        #[arg(long)]
        parallel: bool,

        /// Also score each model family separately
        #[arg(long)]
        components: bool,

        /// Write every backtest record to this CSV file
        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short = 'f', long, default_value = "fwdmap.toml")]
        file: PathBuf,
    },

    /// Show percentile bins (defaults, or those of a config file)
    Bins {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Tracing subscriber already set");
        }
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Analyze {
            input,
            percentile,
            with_backtest,
            matrices,
        } => run_analyze(input, *percentile, *with_backtest, *matrices, cli.output),

        Commands::Backtest {
            input,
            train,
            test,
            step,
            no_purge,
            parallel,
            components,
            records,
        } => {
            let mut session = Session::resolve(input)?;
            if let Some(train) = train {
                session.config.train_window_length = *train;
            }
            if let Some(test) = test {
                session.config.test_window_length = *test;
            }
            if step.is_some() {
                session.config.step = *step;
            }
            if *no_purge {
                session.config.purge_overlapping = false;
            }
            session.config.show_progress = cli.output == OutputFormat::Text;
            run_backtest(&session, *parallel, *components, records.as_deref(), cli.output)
        }

        Commands::Init { file } => init_config(file),

        Commands::Bins { config } => show_bins(config.as_deref(), cli.output),
    }
}

/// Fully resolved inputs of an analysis command.
struct Session {
    config: ForecastConfig,
    instrument: String,
    data_path: PathBuf,
    data_config: DataConfig,
}

impl Session {
    fn resolve(args: &InputArgs) -> Result<Self> {
        let file_config = match &args.config {
            Some(path) => ForecastFileConfig::load(path)?,
            None => ForecastFileConfig::default(),
        };
        let mut config = file_config.to_forecast_config()?;

        if let Some(horizons) = &args.horizons {
            config.horizons = horizons.clone();
        }
        if let Some(bar) = args.bar_duration {
            config.bar_duration = bar;
        }
        if let Some(bw) = &args.bandwidth {
            config.kernel_bandwidth = parse_bandwidth(bw)?;
        }
        config.validate()?;

        let data_path = args
            .data
            .clone()
            .or_else(|| file_config.data.path.as_ref().map(PathBuf::from))
            .ok_or_else(|| {
                ForecastError::InvalidConfiguration(
                    "No data file given (use --data or [data].path)".to_string(),
                )
            })?;

        Ok(Self {
            config,
            instrument: args
                .instrument
                .clone()
                .unwrap_or_else(|| file_config.data.instrument.clone()),
            data_path,
            data_config: DataConfig {
                date_format: file_config.data.date_format.clone(),
                ..Default::default()
            },
        })
    }

    fn load_dataset(&self) -> Result<Dataset> {
        let series = load_csv(&self.data_path, &self.data_config)?;
        DatasetBuilder::from_config(&self.config).build(&series.percentiles, &series.prices)
    }
}

fn parse_bandwidth(value: &str) -> Result<KernelBandwidth> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(KernelBandwidth::Auto);
    }
    value
        .parse::<f64>()
        .map(KernelBandwidth::Fixed)
        .map_err(|_| {
            ForecastError::InvalidConfiguration(format!(
                "Bandwidth must be a number or \"auto\", got '{}'",
                value
            ))
        })
}

fn run_analyze(
    input: &InputArgs,
    percentile: Option<f64>,
    with_backtest: bool,
    matrices: bool,
    output: OutputFormat,
) -> Result<()> {
    let mut session = Session::resolve(input)?;
    session.config.show_progress = output == OutputFormat::Text;
    let dataset = session.load_dataset()?;
    let mapper = ForwardMapper::new(session.config.clone())?;

    if let Some(p) = percentile {
        let predictions = mapper.forecast(&dataset, p)?;
        match output {
            OutputFormat::Text => {
                ReportFormatter::print_predictions(&predictions, session.config.bar_duration)
            }
            OutputFormat::Json => println!("{}", ReportFormatter::to_json(&predictions)),
            OutputFormat::Csv => print!(
                "{}",
                ReportFormatter::forecasts_to_csv(&session.instrument, &predictions)
            ),
        }
        return Ok(());
    }

    let mut report = mapper.analyze(&session.instrument, &dataset)?;

    if with_backtest {
        let backtest = RollingBacktest::new(session.config.clone())?;
        match backtest.run_parallel(&dataset) {
            Ok(run) => report = report.with_accuracy(run.evaluate(&session.config)),
            Err(ForecastError::InsufficientData { required, available }) => {
                info!(
                    "Skipping backtest: {} observations available, {} required",
                    available, required
                );
            }
            Err(e) => return Err(e),
        }
    }

    match output {
        OutputFormat::Text => {
            ReportFormatter::print_report(&report);
            if matrices {
                for matrix in &report.transition_matrices {
                    ReportFormatter::print_transition_matrix(matrix);
                }
            }
        }
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&report)),
        OutputFormat::Csv => print!("{}", ReportFormatter::predictions_to_csv(&report)),
    }
    Ok(())
}

fn run_backtest(
    session: &Session,
    parallel: bool,
    components: bool,
    records_path: Option<&Path>,
    output: OutputFormat,
) -> Result<()> {
    let dataset = session.load_dataset()?;
    let backtest = RollingBacktest::new(session.config.clone())?;

    let run = if parallel {
        backtest.run_parallel(&dataset)?
    } else {
        backtest.run(&dataset)?
    };

    let evaluator = AccuracyEvaluator::new(&session.config);
    let ensemble = evaluator.evaluate(&run.records);
    let per_component: Vec<(ModelKind, _)> = if components {
        ModelKind::ALL
            .into_iter()
            .map(|k| (k, evaluator.evaluate_component(&run.records, k)))
            .collect()
    } else {
        Vec::new()
    };

    if let Some(path) = records_path {
        fs::write(path, ReportFormatter::records_to_csv(&run.records))?;
        info!("Wrote {} records to {}", run.records.len(), path.display());
    }

    match output {
        OutputFormat::Text => {
            ReportFormatter::print_backtest(
                &session.instrument,
                session.config.bar_duration,
                &run,
                &ensemble,
                &per_component,
            )
        }
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&ensemble)),
        OutputFormat::Csv => print!("{}", ReportFormatter::accuracy_to_csv(&ensemble)),
    }
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    fs::write(output, ForecastFileConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file, then run:");
    println!("  fwdmap analyze -c {}", output.display());
    Ok(())
}

fn show_bins(config: Option<&Path>, output: OutputFormat) -> Result<()> {
    let bins = match config {
        Some(path) => ForecastFileConfig::load(path)?.to_forecast_config()?.percentile_bins,
        None => PercentileBins::default(),
    };

    match output {
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&bins)),
        OutputFormat::Text | OutputFormat::Csv => {
            println!("label,lower,upper");
            for bin in &bins {
                println!("{},{},{}", bin.label, bin.lower, bin.upper);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_analyze() {
        let cli = Cli::try_parse_from([
            "fwdmap", "analyze", "-d", "data.csv", "-i", "BTC", "-H", "1,5,20", "--bandwidth", "8",
        ])
        .unwrap();
        match cli.command {
            Commands::Analyze { input, .. } => {
                assert_eq!(input.horizons, Some(vec![1, 5, 20]));
                assert_eq!(input.instrument.as_deref(), Some("BTC"));
            }
            _ => panic!("expected analyze"),
        }
    }

    #[test]
    fn test_cli_parse_backtest() {
        let cli = Cli::try_parse_from([
            "fwdmap", "-v", "backtest", "-d", "data.csv", "--train", "500", "--test", "50",
            "--parallel", "--no-purge", "-b", "4h",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Backtest {
                input,
                train,
                parallel,
                no_purge,
                ..
            } => {
                assert_eq!(train, Some(500));
                assert!(parallel && no_purge);
                assert_eq!(input.bar_duration, Some(BarDuration::Hour(4)));
            }
            _ => panic!("expected backtest"),
        }
    }

    #[test]
    fn test_bins_command() {
        assert!(Cli::try_parse_from(["fwdmap", "bins"]).is_ok());
        assert!(Cli::try_parse_from(["fwdmap", "--output", "json", "bins"]).is_ok());
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("AUTO").unwrap(), KernelBandwidth::Auto);
        assert_eq!(parse_bandwidth("7.5").unwrap(), KernelBandwidth::Fixed(7.5));
        assert!(parse_bandwidth("wide").is_err());
    }

    #[test]
    fn test_session_requires_data_path() {
        let args = InputArgs {
            config: None,
            data: None,
            instrument: None,
            horizons: None,
            bar_duration: None,
            bandwidth: None,
        };
        assert!(matches!(
            Session::resolve(&args),
            Err(ForecastError::InvalidConfiguration(_))
        ));
    }
}
