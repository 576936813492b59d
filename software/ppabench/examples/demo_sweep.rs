//! Sweep a simulated battery with no hardware in the loop.
//!
//! Demonstrated here:
//!   * Opening a device through the driver registry
//!   * Previewing and running a sink ramp with a safety cutoff
//!   * Streaming each tick to CSV and exporting the samples afterward

use ppabench::{Bench, BenchCtx, CsvDispatcher, Dispatcher, RampConfig, TickOutcome, logging};

fn main() -> anyhow::Result<()> {
    let ctx = BenchCtx::new("demo_sweep", std::env::temp_dir());
    let log_path = logging::init_logging(&ctx.op_dir, &ctx.op_name, 1).map_err(anyhow::Error::msg)?;
    println!("Logging to {log_path:?}");

    // 12 V battery behind 0.5 ohm
    let mut bench = Bench::open("demo:voltage=12:resistance=0.5".parse()?)?;
    bench.set_safe_voltage(10.0);

    // 0 to 5 A in 0.25 A steps, 20 ms per step
    let ramp = RampConfig::new(0.0, 5.0, 0.4, 0.02);
    bench.update_ramp(&ramp);
    bench.chart().plot(120, 40);

    let mut dispatchers: Vec<Box<dyn Dispatcher>> = vec![Box::new(CsvDispatcher::default())];
    bench.start_sink()?;
    let period = ramp.step_period().ok_or_else(|| anyhow::anyhow!("empty step"))?;
    match bench.run(period, &ctx, &mut dispatchers)? {
        TickOutcome::SafetyCutoff { voltage, .. } => println!("Cut off at {voltage} V"),
        outcome => println!("Finished: {outcome:?}"),
    }

    bench.chart().plot(120, 40);
    bench.export_csv(&ctx.op_dir.join("demo_sweep_samples.csv"))?;
    println!("Streamed ticks to {:?}", CsvDispatcher::path(&ctx));

    Ok(())
}
