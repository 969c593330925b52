//! confab-rs CLI: validation, analysis and log inspection

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use confab_rs::logger::parse_partition_date;
use confab_rs::{
    FeatureAnnotations, FeatureDiffAnalyzer, HttpJudge, LogCorpus, PipelineConfig,
    SessionSummary, SparseFeatureDecoder, TurnLabel, ValidationEngine, ValidationReport,
    WeightsStore,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "confab-rs")]
#[command(about = "Activation capture and confabulation validation")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Label every assistant turn of the given days
    Validate {
        /// Session log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Day to validate (YYYYMMDD), repeatable
        #[arg(long = "date", required = true)]
        dates: Vec<String>,
        /// Fabrication judge endpoint
        #[arg(long)]
        judge_endpoint: Option<String>,
        /// Derived results file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Rank features by confabulation specificity
    Analyze {
        #[arg(long)]
        log_dir: Option<PathBuf>,
        #[arg(long = "date", required = true)]
        dates: Vec<String>,
        /// Results file written by `validate`
        #[arg(long)]
        labels: PathBuf,
        /// JSON map of feature index to description
        #[arg(long)]
        annotations: Option<PathBuf>,
        /// Write the full feature table here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Number of features to print
        #[arg(long, default_value_t = 20)]
        top: usize,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Entry counts of one day's session logs
    Summary {
        #[arg(long, default_value = "session_logs")]
        log_dir: PathBuf,
        #[arg(long)]
        date: String,
    },
    /// Load decoder weights and print the resolved schema
    InspectDecoder {
        /// Local directory or HuggingFace repository
        #[arg(long)]
        store: String,
        /// Sub-directory inside the store
        #[arg(long)]
        subfolder: Option<String>,
        /// Features kept per decode
        #[arg(long, default_value_t = confab_rs::DEFAULT_TOP_N)]
        top_n: usize,
        /// Force CPU mode
        #[arg(long)]
        cpu: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Validate {
            log_dir,
            dates,
            judge_endpoint,
            output,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = log_dir {
                config.log_dir = dir;
            }
            if let Some(endpoint) = judge_endpoint {
                config.judge.endpoint = endpoint;
            }
            if let Some(path) = output {
                config.output = path;
            }
            config.validate()?;
            run_validate(&config, &parse_dates(&dates)?)
        }
        Command::Analyze {
            log_dir,
            dates,
            labels,
            annotations,
            output,
            top,
            config,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = log_dir {
                config.log_dir = dir;
            }
            run_analyze(
                &config.log_dir,
                &parse_dates(&dates)?,
                &labels,
                annotations.as_deref(),
                output.as_deref(),
                top,
            )
        }
        Command::Summary { log_dir, date } => {
            let date = parse_partition_date(&date)?;
            let summary = SessionSummary::collect(&log_dir, date)?;
            println!("=== Session logs for {} ===", summary.date);
            println!("Chat:        {:5}  {}", summary.chat_entries, summary.chat_file.display());
            println!(
                "Activations: {:5}  {}",
                summary.activation_entries,
                summary.activations_file.display()
            );
            println!(
                "Tools:       {:5}  {}",
                summary.tool_executions,
                summary.tools_file.display()
            );
            Ok(())
        }
        Command::InspectDecoder {
            store,
            subfolder,
            top_n,
            cpu,
        } => {
            let device = if cpu {
                Device::Cpu
            } else {
                Device::cuda_if_available(0)?
            };
            let store = WeightsStore::resolve(&store, subfolder.as_deref());
            let decoder = SparseFeatureDecoder::load(&store, top_n, &device)
                .with_context(|| format!("loading decoder from {}", store.describe()))?;
            let c = decoder.config();
            println!("=== Decoder: {} ===", c.source);
            println!("d_in:       {}", c.d_in);
            println!("d_hidden:   {}", c.d_hidden);
            println!("dtype:      {:?}", c.dtype);
            println!("top_n:      {}", decoder.top_n());
            match c.hook_layer {
                Some(layer) => println!("hook layer: {layer}"),
                None => println!("hook layer: (not declared)"),
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = PipelineConfig::load_or_default(path)?;
    if let Some(p) = path {
        info!("Configuration from {}", p.display());
    }
    Ok(config)
}

fn parse_dates(dates: &[String]) -> Result<Vec<NaiveDate>> {
    dates
        .iter()
        .map(|d| parse_partition_date(d).map_err(Into::into))
        .collect()
}

fn run_validate(config: &PipelineConfig, dates: &[NaiveDate]) -> Result<()> {
    println!("=== confab-rs: validation ===");
    println!("Logs:   {}", config.log_dir.display());
    println!("Judge:  {}", config.judge.endpoint);
    println!("Output: {}", config.output.display());

    let corpus = LogCorpus::load(&config.log_dir, dates)
        .with_context(|| format!("reading session logs in {}", config.log_dir.display()))?;
    let judge = HttpJudge::new(&config.judge)?;
    let engine = ValidationEngine::new(judge, config.validation.clone())?;
    let report = engine.run(&corpus);
    report.write_atomic(&config.output)?;

    let summary = &report.summary;
    println!("\n=== Labels ({} turns) ===", summary.total);
    for label in TurnLabel::TERMINAL {
        println!("{:16} {:5}", label.to_string(), summary.count(label));
    }
    println!("{:16} {:5}", TurnLabel::Unresolved.to_string(), summary.unresolved);

    if !summary.regime.is_empty() {
        println!("\n=== Regime heuristic vs. ground truth ===");
        for (label, diag) in &summary.regime {
            println!(
                "{:16} n={:<4} mean distance {:6.2}  transformed {:5.1}%",
                label.to_string(),
                diag.turns_with_snapshot,
                diag.mean_regime_distance.unwrap_or(0.0),
                diag.fraction_transformed.unwrap_or(0.0) * 100.0
            );
        }
    }
    Ok(())
}

fn run_analyze(
    log_dir: &Path,
    dates: &[NaiveDate],
    labels_path: &Path,
    annotations: Option<&Path>,
    output: Option<&Path>,
    top: usize,
) -> Result<()> {
    let report = ValidationReport::load(labels_path)
        .with_context(|| format!("reading validation results {}", labels_path.display()))?;
    let corpus = LogCorpus::load(log_dir, dates)?;
    let mut diff = FeatureDiffAnalyzer::new().analyze(&report.labels, &corpus);
    if let Some(path) = annotations {
        diff.annotate(&FeatureAnnotations::load(path)?);
    }

    println!("=== Feature specificity ===");
    println!(
        "Confabulated turns: {}, honest turns: {}, unresolved (excluded): {}",
        diff.n_confabulation, diff.n_honest, diff.excluded_unresolved
    );
    println!(
        "\n{:>8} {:>8} {:>8} {:>8} {:>9}  description",
        "feature", "score", "p_conf", "p_hon", "p_value"
    );
    for stat in diff.top(top) {
        let p = stat
            .p_value
            .map_or_else(|| "-".to_string(), |p| format!("{p:.4}"));
        println!(
            "{:>8} {:>+8.3} {:>8.3} {:>8.3} {:>9}  {}",
            stat.feature_index,
            stat.specificity_score,
            stat.p_confab,
            stat.p_honest,
            p,
            stat.description.as_deref().unwrap_or("")
        );
    }

    if let Some(path) = output {
        diff.write_json(path)?;
    }
    Ok(())
}
