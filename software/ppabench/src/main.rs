use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use ppabench::device::DRIVERS;
use ppabench::{Bench, BenchConfig, CsvDispatcher, DriverSpec, RampConfig, TickOutcome, logging};

/// Terminal plot size in braille dots
const PLOT_WIDTH: u32 = 160;
const PLOT_HEIGHT: u32 = 60;

#[derive(Parser, Debug)]
#[command(name = "ppabench", version, about)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Instrument to open, as `driver:key=value:...`
    /// (for example `scpi-pps:conn=/dev/ttyUSB0:serialcomm=9600/8n1`)
    #[arg(short, long, global = true)]
    driver: Option<DriverSpec>,

    /// Name for this op's log and data files
    #[arg(long, global = true)]
    op_name: Option<String>,

    /// Directory for this op's log and data files
    #[arg(long, global = true)]
    op_dir: Option<PathBuf>,

    /// Stream every tick to `<op_dir>/<op_name>.csv`
    #[arg(long, global = true)]
    stream: bool,

    /// Log setpoint writes (-v) and instrument traffic (-vv); `RUST_LOG` takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available drivers
    Drivers,

    /// Identify the instrument and print its settings
    Probe,

    /// Sweep drawn current along a ramp while watching the voltage
    Sink(SinkArgs),

    /// Source a fixed voltage and log the current
    Supply(SupplyArgs),

    /// Write the effective configuration to a JSON file
    SaveConfig {
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct SinkArgs {
    /// First current setpoint [A]
    #[arg(long)]
    start: Option<f64>,

    /// Last current setpoint [A]
    #[arg(long)]
    end: Option<f64>,

    /// Sweep duration [s]
    #[arg(long)]
    duration: Option<f64>,

    /// Time per setpoint [s]
    #[arg(long)]
    step: Option<f64>,

    /// Stop when the voltage drops below this [V]
    #[arg(long)]
    safe_voltage: Option<f64>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct SupplyArgs {
    /// Output voltage [V]
    #[arg(long)]
    voltage: Option<f64>,

    /// Current limit [A]
    #[arg(long)]
    current: Option<f64>,

    /// Run time [s]; runs until interrupted if not given
    #[arg(long)]
    duration: Option<f64>,

    /// Poll period [ms]
    #[arg(long)]
    period_ms: Option<u64>,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Export the samples to a two-column CSV when the run ends
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Plot the run in the terminal when it ends
    #[arg(long)]
    plot: bool,
}

impl Cli {
    /// Fold command line overrides into the config
    fn apply(&self, cfg: &mut BenchConfig) {
        if let Some(driver) = &self.driver {
            cfg.driver = Some(driver.clone());
        }
        if let Some(op_name) = &self.op_name {
            cfg.ctx.op_name = op_name.clone();
        }
        if let Some(op_dir) = &self.op_dir {
            cfg.ctx.op_dir = op_dir.clone();
        }
        if self.stream {
            cfg.dispatchers.push(Box::new(CsvDispatcher::default()));
        }

        match &self.command {
            Command::Sink(args) => {
                let RampConfig {
                    start,
                    end,
                    duration_s,
                    step_s,
                } = cfg.ramp;
                cfg.ramp = RampConfig::new(
                    args.start.unwrap_or(start),
                    args.end.unwrap_or(end),
                    args.duration.unwrap_or(duration_s),
                    args.step.unwrap_or(step_s),
                );
                if let Some(v) = args.safe_voltage {
                    cfg.safe_voltage = v;
                }
            }
            Command::Supply(args) => {
                if let Some(v) = args.voltage {
                    cfg.supply.voltage = v;
                }
                if let Some(a) = args.current {
                    cfg.supply.current_limit = a;
                }
                if args.duration.is_some() {
                    cfg.supply.duration_s = args.duration;
                }
                if let Some(ms) = args.period_ms {
                    cfg.poll_period_ms = ms;
                }
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => BenchConfig::load(path)?,
        None => BenchConfig::default(),
    };
    cli.apply(&mut cfg);

    match &cli.command {
        Command::Drivers => {
            print!("{}", driver_listing());
            return Ok(());
        }
        Command::SaveConfig { path } => {
            cfg.save(path)?;
            println!("Saved config to {path:?}");
            return Ok(());
        }
        _ => {}
    }

    logging::init_logging(&cfg.ctx.op_dir, &cfg.ctx.op_name, cli.verbose)
        .map_err(anyhow::Error::msg)?;

    let Some(spec) = cfg.driver.clone() else {
        bail!(
            "no instrument selected; pass --driver <driver:key=value:...>\n\n{}",
            driver_listing()
        );
    };
    let mut bench = Bench::open(spec.clone()).with_context(|| format!("failed to open `{spec}`"))?;

    match &cli.command {
        Command::Probe => probe(&mut bench),
        Command::Sink(args) => run_sink(&mut bench, &mut cfg, &args.output),
        Command::Supply(args) => run_supply(&mut bench, &mut cfg, &args.output),
        Command::Drivers | Command::SaveConfig { .. } => Ok(()),
    }
}

fn driver_listing() -> String {
    let mut out = String::from("Available drivers:\n");
    for driver in DRIVERS.values() {
        out.push_str(&format!("  {:<10} {}\n", driver.name, driver.long_name));
    }
    out
}

fn probe(bench: &mut Bench) -> anyhow::Result<()> {
    let info = bench.describe()?;
    println!("Driver:   {}", info.driver);
    println!("Identity: {}", info.identity);
    println!("Channels: {}", info.channels.join(", "));
    for (key, value) in info.config.iter() {
        println!("  {:<16} {value}", key.description());
    }
    Ok(())
}

fn run_sink(bench: &mut Bench, cfg: &mut BenchConfig, output: &OutputArgs) -> anyhow::Result<()> {
    if !bench.update_ramp(&cfg.ramp) {
        bail!("ramp {:?} has no steps", cfg.ramp);
    }
    let period = cfg
        .ramp
        .step_period()
        .context("ramp step must be a positive duration")?;
    bench.set_safe_voltage(cfg.safe_voltage);

    if output.plot {
        println!("Ramp preview:");
        bench.chart().plot(PLOT_WIDTH, PLOT_HEIGHT);
    }

    bench.start_sink()?;
    let outcome = bench.run(period, &cfg.ctx, &mut cfg.dispatchers)?;
    finish_run(bench, outcome, output)
}

fn run_supply(bench: &mut Bench, cfg: &mut BenchConfig, output: &OutputArgs) -> anyhow::Result<()> {
    let mut ctx = cfg.ctx.clone();
    ctx.termination_criteria.extend(cfg.supply_termination());
    if ctx.termination_criteria.is_empty() {
        warn!("No run duration set; the supply test runs until the process is stopped");
    }

    bench.start_supply(
        cfg.supply.voltage,
        cfg.supply.current_limit,
        cfg.supply.duration_s,
    )?;
    let outcome = bench.run(cfg.poll_period(), &ctx, &mut cfg.dispatchers)?;
    finish_run(bench, outcome, output)
}

/// Report the outcome and write the requested outputs.
/// An aborted run still exports what was recorded before failing.
fn finish_run(bench: &Bench, outcome: TickOutcome, output: &OutputArgs) -> anyhow::Result<()> {
    match &outcome {
        TickOutcome::SafetyCutoff { voltage, threshold } => {
            println!("Stopped at {voltage} V, below the {threshold} V cutoff")
        }
        TickOutcome::Aborted(reason) => println!("Run aborted: {reason}"),
        _ => println!("Run complete"),
    }
    println!("Recorded {} samples", bench.samples().len());

    if let Some(path) = &output.csv {
        export(bench, path)?;
    }
    if output.plot {
        bench.chart().plot(PLOT_WIDTH, PLOT_HEIGHT);
    }

    if let TickOutcome::Aborted(reason) = outcome {
        bail!("run aborted: {reason}");
    }
    Ok(())
}

fn export(bench: &Bench, path: &Path) -> anyhow::Result<()> {
    bench
        .export_csv(path)
        .with_context(|| format!("failed to export samples to {path:?}"))?;
    println!("Saved samples to {path:?}");
    Ok(())
}
