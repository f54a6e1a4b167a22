//! NSim CLI
//!
//! Run the built-in network scenarios, export runs for visualization and
//! run sensitivity analyses over scenario constants.

use clap::Parser;
use nsim_core::ModelConfig;
use nsim_sim::models::{default_visualization, initial_state, sensitivity_bounds};
use nsim_sim::scenarios::ScenarioId;
use nsim_sim::{
    Layout, Result, ScenarioResult, ScenarioRunner, SensitivityAnalysis, SensitivityConfig,
    Statistic, VisualizationConfig,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// NSim discrete-time network simulation CLI
#[derive(Parser, Debug)]
#[command(name = "nsim")]
#[command(about = "Run discrete-time network simulation scenarios", long_about = None)]
struct Args {
    /// Seed of the model's random stream
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (craving, hiom, rewire, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Ticks to run (scenario default if unset)
    #[arg(short, long)]
    ticks: Option<u64>,

    /// Node count (scenario default if unset)
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Model configuration JSON file
    #[arg(long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export the run to a JSON file for the visualizer
    #[arg(long)]
    export: Option<String>,

    /// Colour map written to the export (scenario default if unset)
    #[arg(long)]
    color_scale: Option<String>,

    /// Node layout written to the export (spring, fr)
    #[arg(long)]
    layout: Option<String>,

    /// Rendered plot path the front-end should write
    #[arg(long)]
    plot_output: Option<String>,

    /// Stream snapshots to this directory
    #[arg(long)]
    snapshots: Option<String>,

    /// Snapshot interval in ticks for --snapshots
    #[arg(long, default_value = "1")]
    snapshot_interval: u64,

    /// Run a Sobol sensitivity analysis with this many base samples
    #[arg(long)]
    sensitivity: Option<usize>,

    /// Also estimate second-order Sobol indices
    #[arg(long)]
    second_order: bool,

    /// Statistic reduced from the final state (mean, variance, min, max)
    #[arg(long, default_value = "mean")]
    statistic: String,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.json { Level::WARN } else { level })
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    match run(&args) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every run passed.
fn run(args: &Args) -> Result<bool> {
    if !args.json {
        info!("NSim v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                eprintln!("Available scenarios: craving, hiom, rewire, all");
                std::process::exit(1);
            }
        }
    };

    let mut config = match &args.config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig::default(),
    };
    config.seed = args.seed;

    let mut runner = ScenarioRunner::new(args.seed).with_config(config);
    if let Some(ticks) = args.ticks {
        runner = runner.with_ticks(ticks);
    }
    if let Some(nodes) = args.nodes {
        runner = runner.with_nodes(nodes);
    }
    if let Some(dir) = &args.snapshots {
        runner = runner.with_snapshot_dir(dir, args.snapshot_interval);
    }

    if let Some(samples) = args.sensitivity {
        if scenarios.len() > 1 {
            eprintln!("Error: --sensitivity only supports a single scenario, not 'all'");
            std::process::exit(1);
        }
        return run_sensitivity(args, &runner, scenarios[0], samples);
    }

    if args.export.is_some() && scenarios.len() > 1 {
        eprintln!("Error: --export only supports a single scenario, not 'all'");
        std::process::exit(1);
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for scenario in &scenarios {
        let result = runner.run(*scenario)?;

        if !args.json {
            if result.passed {
                info!("✓ {} (seed={}) PASSED", scenario.name(), args.seed);
                for (name, value) in &result.final_means {
                    info!("    mean {:<16} {:>12.6}", name, value);
                }
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    scenario.name(),
                    args.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        if let Some(path) = &args.export {
            let export = result.to_export_with(visualization(args, *scenario))?;
            export.write_to_file(path)?;
            info!("Exported {} frames to {}", export.frames.len(), path);
        }

        all_results.push(result);
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "ticks": r.total_ticks,
                    "nodes": r.final_node_count,
                    "edges": r.final_edge_count,
                    "means": r.final_means,
                    "properties": r.final_properties,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
        }
    }

    Ok(failed_count == 0)
}

/// Scenario plot settings with the CLI overrides applied.
fn visualization(args: &Args, scenario: ScenarioId) -> VisualizationConfig {
    let mut config = default_visualization(scenario);
    if let Some(scale) = &args.color_scale {
        config = config.with_color_scale(scale.as_str());
    }
    if let Some(layout) = &args.layout {
        match layout.parse::<Layout>() {
            Ok(layout) => config = config.with_layout(layout),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
    if let Some(output) = &args.plot_output {
        config = config.with_output(output.as_str());
    }
    config
}

fn run_sensitivity(
    args: &Args,
    runner: &ScenarioRunner,
    scenario: ScenarioId,
    samples: usize,
) -> Result<bool> {
    let statistic: Statistic = match args.statistic.parse() {
        Ok(statistic) => statistic,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let config = SensitivityConfig::new(sensitivity_bounds(scenario), samples)
        .with_statistic(statistic)
        .with_second_order(args.second_order)
        .with_ticks(args.ticks.unwrap_or_else(|| scenario.default_ticks()))
        .with_seed(args.seed);
    let analysis = SensitivityAnalysis::new(config)?;
    let report = analysis.run_fresh(|| runner.build(scenario), &initial_state(scenario))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "Sensitivity of {} ({} runs, {})",
            scenario.name(),
            report.parameters.len(),
            statistic
        );
        let show = |v: &Option<f64>| v.map_or("n/a".to_string(), |v| format!("{:+.3}", v));
        for (state, sobol) in &report.indices {
            info!("  {}", state);
            for (constant, first) in &sobol.first_order {
                let total = sobol.total_order.get(constant).copied().flatten();
                info!(
                    "    {:<8} S1 = {:>7}  ST = {:>7}",
                    constant,
                    show(first),
                    show(&total)
                );
            }
        }
    }
    Ok(true)
}
