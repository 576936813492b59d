//! End-to-end runs against the simulated instrument

use std::time::Duration;

use ppabench::device::ConfigValue;
use ppabench::{
    Bench, BenchCtx, BenchError, ConfigKey, CsvDispatcher, DeviceError, Dispatcher, DriverSpec,
    Mode, RampConfig, Termination, TickOutcome,
};

fn open(spec: &str) -> Bench {
    Bench::open(spec.parse::<DriverSpec>().unwrap()).unwrap()
}

#[test]
fn sink_sweep_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = BenchCtx::new("sweep", dir.path().to_owned());
    let mut dispatchers: Vec<Box<dyn Dispatcher>> = vec![Box::new(CsvDispatcher::new(1))];

    let mut bench = open("demo:voltage=12:resistance=0.1");
    let ramp = RampConfig::new(0.0, 2.0, 0.02, 0.005);
    assert!(bench.update_ramp(&ramp));
    assert_eq!(bench.ramp().len(), 5);

    bench.start_sink().unwrap();
    let outcome = bench
        .run(ramp.step_period().unwrap(), &ctx, &mut dispatchers)
        .unwrap();
    assert_eq!(outcome, TickOutcome::Completed);
    assert_eq!(bench.mode(), Mode::Idle);

    // One sample per setpoint plus the read that found the ramp exhausted
    let samples = bench.samples();
    assert_eq!(samples.len(), 6);
    assert_eq!((samples[0].x, samples[0].y), (0.0, 12.0));
    let last = samples.last().unwrap();
    assert!((last.x - 2.0).abs() < 1e-9);
    assert!((last.y - 11.8).abs() < 1e-9);

    // Streamed log has a header and one row per tick
    let streamed = std::fs::read_to_string(CsvDispatcher::path(&ctx)).unwrap();
    let lines: Vec<&str> = streamed.lines().collect();
    assert_eq!(lines[0], "timestamp,time,mode,voltage,current,setpoint");
    assert_eq!(lines.len(), 7);

    let export = dir.path().join("sweep_export.csv");
    bench.export_csv(&export).unwrap();
    let exported = std::fs::read_to_string(&export).unwrap();
    assert!(exported.starts_with("A,V\n0,12\n"));
    assert_eq!(exported.lines().count(), 7);
}

#[test]
fn sink_sweep_stops_below_safe_voltage() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = BenchCtx::new("cutoff", dir.path().to_owned());

    // Terminal voltage is 12 - 2 * I
    let mut bench = open("demo:voltage=12:resistance=2");
    bench.set_safe_voltage(5.0);
    bench.update_ramp(&RampConfig::new(0.0, 5.0, 0.01, 0.002));
    bench.start_sink().unwrap();

    let outcome = bench.run(Duration::from_millis(1), &ctx, &mut []).unwrap();
    assert_eq!(
        outcome,
        TickOutcome::SafetyCutoff {
            voltage: 4.0,
            threshold: 5.0
        }
    );

    let info = bench.describe().unwrap();
    assert_eq!(info.config[&ConfigKey::Enabled], ConfigValue::Bool(false));
    assert_eq!(info.config[&ConfigKey::CurrentLimit], ConfigValue::Float(0.0));

    // The ramp still had a step left, which was never written
    assert_eq!(bench.samples().len(), 6);
}

#[test]
fn supply_run_logs_current_over_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = BenchCtx::new("supply", dir.path().to_owned());
    ctx.termination_criteria = vec![Termination::Samples(4)];

    let mut bench = open("demo:load=10");
    bench.start_supply(5.0, 1.0, None).unwrap();
    let outcome = bench.run(Duration::from_millis(2), &ctx, &mut []).unwrap();
    assert_eq!(outcome, TickOutcome::Completed);
    assert_eq!(bench.last_mode(), Mode::SupplyTest);

    let samples = bench.samples();
    assert_eq!(samples.len(), 4);
    assert!(samples.iter().all(|s| (s.y - 0.5).abs() < 1e-12));
    assert!(samples.windows(2).all(|w| w[1].x > w[0].x));

    let export = dir.path().join("supply.csv");
    bench.export_csv(&export).unwrap();
    assert!(std::fs::read_to_string(&export).unwrap().starts_with("s,A\n"));
}

#[test]
fn communication_failure_aborts_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = BenchCtx::new("flaky", dir.path().to_owned());

    // Opening and starting take six operations and each sink tick takes three,
    // so the second tick fails partway through
    let mut bench = open("demo:fail_after=10");
    bench.update_ramp(&RampConfig::new(0.0, 1.0, 1.0, 0.1));
    bench.start_sink().unwrap();

    let outcome = bench.run(Duration::from_millis(1), &ctx, &mut []).unwrap();
    assert!(matches!(outcome, TickOutcome::Aborted(_)));
    assert_eq!(bench.mode(), Mode::Idle);
    assert_eq!(bench.samples().len(), 1);

    // Reopened device is usable
    assert_eq!(bench.tick().unwrap(), TickOutcome::Idle);
}

#[test]
fn unknown_driver_is_rejected() {
    let spec: DriverSpec = "nope:conn=/dev/null".parse().unwrap();
    assert!(matches!(
        Bench::open(spec),
        Err(BenchError::Device(DeviceError::UnknownDriver(name))) if name == "nope"
    ));
}
