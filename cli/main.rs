#![deny(unused_variables)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use csv::{ReaderBuilder, StringRecord};
use riskadjust::drivers::CostDriverAnalysis;
use riskadjust::hcc::{CategoryStatus, ConditionTaxonomy, HccMapper};
use riskadjust::models::trainer::{CandidateStatus, PartSummary};
use riskadjust::{EngineConfig, Gender, PredictionSet, RawMemberRow, RiskEngine, TrainingReport};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[derive(Args)]
pub struct EngineArgs {
    /// Engine configuration (TOML). Built-in defaults are used when omitted.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Condition taxonomy (TOML). The built-in taxonomy is used when omitted.
    #[arg(long, value_name = "PATH")]
    pub taxonomy: Option<PathBuf>,

    /// Overrides the training seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Overrides the number of cross-validation folds
    #[arg(long, value_name = "K")]
    pub folds: Option<usize>,
}

#[derive(Args)]
pub struct TrainArgs {
    /// Member CSV with member_id,age,gender,total_claims,total_cost and one column per condition
    pub training_data: PathBuf,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Where to write the training summary
    #[arg(long, default_value = "training_summary.toml")]
    pub summary_out: PathBuf,
}

#[derive(Args)]
pub struct AnalyzeArgs {
    /// Member CSV used to train the model
    pub training_data: PathBuf,

    /// Members to predict and explain; defaults to the training members
    #[arg(long, value_name = "PATH")]
    pub members: Option<PathBuf>,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Directory for predictions.tsv and drivers.tsv
    #[arg(long, default_value = ".")]
    pub out_dir: PathBuf,
}

#[derive(Args)]
pub struct HccArgs {
    /// Condition keys, e.g. diabetes hypertension
    pub conditions: Vec<String>,

    #[arg(long)]
    pub age: Option<f64>,

    /// f/female/0 or m/male/1
    #[arg(long)]
    pub gender: Option<String>,

    #[arg(long, value_name = "PATH")]
    pub taxonomy: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "riskadjust",
    about = "HCC risk scoring, two-part PMPM modelling and cost-driver attribution",
    long_about = "Scores members against a hierarchical condition-category taxonomy, trains a \
                 two-part utilization/cost model with cross-validated family selection, and \
                 explains predicted cost with Shapley attributions."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the two-part model and report the selected families
    #[command(about = "Train the two-part model (outputs: training_summary.toml)")]
    Train(TrainArgs),

    /// Train, predict and explain cost drivers in one pass
    #[command(about = "Predict and explain cost drivers (outputs: predictions.tsv, drivers.tsv)")]
    Analyze(AnalyzeArgs),

    /// Score a set of conditions against the taxonomy
    #[command(about = "Compute an HCC risk score for a condition list")]
    Hcc(HccArgs),

    /// Print the default engine configuration
    #[command(about = "Print the default engine configuration as TOML")]
    Config,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Analyze(args)) => analyze(args),
        Some(Commands::Hcc(args)) => score_hcc(args),
        Some(Commands::Config) => print_default_config(),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn build_engine(args: &EngineArgs) -> Result<RiskEngine, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if let Some(folds) = args.folds {
        config.training.k_folds = folds;
    }
    let engine = match &args.taxonomy {
        Some(path) => RiskEngine::with_taxonomy(config, Arc::new(ConditionTaxonomy::load(path)?))?,
        None => RiskEngine::new(config)?,
    };
    Ok(engine)
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(&args.engine)?;
    println!("Loading members from: {}", args.training_data.display());
    let rows = read_member_rows(&args.training_data)?;
    println!("Loaded {} members", rows.len());

    let report = engine.train(&rows)?;
    print_training_report(&report);

    std::fs::write(&args.summary_out, toml::to_string_pretty(&report)?)?;
    println!("Training summary saved to: {}", args.summary_out.display());
    Ok(())
}

pub fn analyze(args: AnalyzeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let engine = build_engine(&args.engine)?;
    let training_rows = read_member_rows(&args.training_data)?;
    println!("Training on {} members from {}", training_rows.len(), args.training_data.display());
    let report = engine.train(&training_rows)?;
    print_training_report(&report);

    let members = match &args.members {
        Some(path) => read_member_rows(path)?,
        None => training_rows,
    };
    let predictions = engine.predict(&members)?;
    let analysis = engine.analyze(&members)?;

    std::fs::create_dir_all(&args.out_dir)?;
    let predictions_path = args.out_dir.join("predictions.tsv");
    save_predictions(&predictions, &predictions_path)?;
    println!("Predictions saved to: {}", predictions_path.display());
    let drivers_path = args.out_dir.join("drivers.tsv");
    save_drivers(&analysis, &drivers_path)?;
    println!("Driver ranking saved to: {}", drivers_path.display());

    println!();
    for insight in &analysis.insights {
        println!("{:>2}. {}", insight.rank, insight.text);
    }
    let warnings = analysis.fallback_warnings().count();
    if warnings > 0 {
        println!("{warnings} attribution(s) used the permutation-importance fallback.");
    }
    Ok(())
}

fn score_hcc(args: HccArgs) -> Result<(), Box<dyn std::error::Error>> {
    let taxonomy = match &args.taxonomy {
        Some(path) => ConditionTaxonomy::load(path)?,
        None => ConditionTaxonomy::builtin()?,
    };
    let mapper = HccMapper::new(Arc::new(taxonomy));
    let keys = args.conditions.iter().map(String::as_str);
    let score = match args.age {
        Some(age) => {
            let gender = args.gender.as_deref().map_or(Gender::Unknown, Gender::normalize);
            mapper.score_member(keys, age, gender)
        }
        None => mapper.score_conditions(keys),
    };

    println!("Taxonomy: {}", mapper.taxonomy().version());
    for category in &score.categories {
        let status = match &category.status {
            CategoryStatus::Counted => "counted".to_string(),
            CategoryStatus::Suppressed { by } => format!("suppressed by {by}"),
        };
        println!(
            "  {:<8} {:>6.3}  {:<40} {}",
            category.id, category.weight, category.label, status
        );
    }
    for unknown in &score.unknown_conditions {
        println!("  (unknown condition '{unknown}' ignored)");
    }
    println!("Condition score:        {:.3}", score.condition_score);
    println!("Demographic adjustment: {:.3}", score.demographic_adjustment);
    println!("Risk score:             {:.3}", score.total);
    Ok(())
}

fn print_default_config() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", toml::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}

fn print_training_report(report: &TrainingReport) {
    let summary = &report.summary;
    println!(
        "Model artifact v{}: {} members, {} with utilization",
        report.artifact_version, summary.rows, summary.positive_rows
    );
    print_part(&summary.utilization);
    print_part(&summary.cost);
    println!(
        "Combined PMPM (in-sample): R² {:.4}, RMSE {:.2}",
        summary.combined_r2, summary.combined_rmse
    );
}

fn print_part(part: &PartSummary) {
    println!("[{}] selected {} on {} rows", part.part, part.family, part.rows);
    if let Some(reason) = &part.constant_reason {
        println!("    constant model: {reason}");
    }
    for candidate in &part.leaderboard {
        let marker = if candidate.selected { "*" } else { " " };
        match &candidate.status {
            CandidateStatus::Scored { r2, rmse } => println!(
                "  {marker} {:<18} CV R² {r2:>8.4}  RMSE {rmse:>10.4}",
                candidate.family.as_str()
            ),
            CandidateStatus::Failed { reason } => {
                println!("  {marker} {:<18} failed: {reason}", candidate.family.as_str())
            }
        }
    }
}

fn save_predictions(predictions: &PredictionSet, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(
        writer,
        "member_id\tutilization_probability\tconditional_cost\tpredicted_pmpm\trelative_risk\trisk_tier"
    )?;
    for (member_id, result) in &predictions.results {
        writeln!(
            writer,
            "{member_id}\t{:.6}\t{:.4}\t{:.4}\t{:.4}\t{}",
            result.utilization_probability,
            result.conditional_cost,
            result.predicted_pmpm,
            result.context.relative_risk,
            result.context.risk_tier.as_str()
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn save_drivers(analysis: &CostDriverAnalysis, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(
        writer,
        "rank\tfeature\tmean_abs_contribution\tmean_contribution\tdirection\tcorrelation"
    )?;
    for driver in &analysis.ranking.drivers {
        let r = analysis
            .correlations
            .get(&driver.feature)
            .map_or_else(|| "NA".to_string(), |r| format!("{r:.4}"));
        writeln!(
            writer,
            "{}\t{}\t{:.6}\t{:.6}\t{:?}\t{r}",
            driver.rank,
            driver.feature,
            driver.mean_abs_contribution,
            driver.mean_contribution,
            driver.direction
        )?;
    }
    writer.flush()?;
    Ok(())
}

const MEMBER_FIELDS: [&str; 5] = ["member_id", "age", "gender", "total_claims", "total_cost"];

/// Reads member rows from a CSV. Columns other than the member fields are
/// condition indicators; blank cells are left missing.
fn read_member_rows(path: &Path) -> Result<Vec<RawMemberRow>, Box<dyn std::error::Error>> {
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    for field in MEMBER_FIELDS {
        if !headers.iter().any(|h| h == field) {
            log::warn!("Column '{field}' not found in {}", path.display());
        }
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        rows.push(parse_row(&headers, &record, line + 2)?);
    }
    Ok(rows)
}

fn parse_row(
    headers: &[String],
    record: &StringRecord,
    line: usize,
) -> Result<RawMemberRow, Box<dyn std::error::Error>> {
    let mut row = RawMemberRow::default();
    for (header, cell) in headers.iter().zip(record.iter()) {
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }
        let number = || -> Result<f64, Box<dyn std::error::Error>> {
            cell.parse::<f64>()
                .map_err(|_| format!("line {line}: column '{header}' is not a number: '{cell}'").into())
        };
        match header.as_str() {
            "member_id" => row.member_id = Some(cell.to_string()),
            "gender" => row.gender = Some(cell.to_string()),
            "age" => row.age = Some(number()?),
            "total_claims" => row.total_claims = Some(number()?),
            "total_cost" => row.total_cost = Some(number()?),
            condition => {
                let value = match cell.to_ascii_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" => 1.0,
                    "false" | "f" | "no" | "n" => 0.0,
                    _ => number()?,
                };
                row.conditions.insert(condition.to_string(), value);
            }
        }
    }
    Ok(row)
}
