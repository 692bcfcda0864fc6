use std::{fs, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;
use strokescreen::screening::{
    active_config, registry::test_registry, ControllerAction, ControllerOutput, ManualSensor,
    Sample, ScreeningConfig, SensorChannel, TestController, TestProfile,
};

mod logging;

#[derive(Parser, Debug)]
#[command(name = "screen_replay")]
#[command(about = "Replay a recorded sensor trace through one screening test")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "Balance")]
    profile: String,
    #[arg(long)]
    difficulty: Option<u8>,
    #[arg(long = "log-json")]
    log_json: Option<PathBuf>,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    list: bool,
    #[arg(required_unless_present = "list")]
    trace: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum TraceEvent {
    Sample {
        channel: SensorChannel,
        sample: Sample,
    },
    Step {
        ms: u64,
        matched: bool,
    },
    External {
        ms: u64,
        score: f32,
        abnormal: bool,
    },
}

impl TraceEvent {
    fn ms(&self) -> u64 {
        match self {
            Self::Sample { sample, .. } => sample.timestamp_ms,
            Self::Step { ms, .. } | Self::External { ms, .. } => *ms,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    logging::Logger::new(level, cli.log_json.clone())?.install()?;

    let config = match &cli.config {
        Some(path) => ScreeningConfig::load(path)?,
        None => active_config()?.clone(),
    };
    if cli.list {
        for line in registry_lines(&config) {
            println!("{line}");
        }
        return Ok(());
    }
    let profile = config.profile(&cli.profile)?.clone();

    let Some(trace) = cli.trace.as_ref() else {
        bail!("a trace file is required unless --list is given");
    };
    let raw = fs::read_to_string(trace)
        .with_context(|| format!("failed to read {}", trace.display()))?;
    let events = parse_trace(&raw)?;

    for line in replay(profile, cli.difficulty, &events)? {
        println!("{line}");
    }
    Ok(())
}

fn registry_lines(config: &ScreeningConfig) -> Vec<String> {
    test_registry(config)
        .iter()
        .map(|registration| {
            let position = registration
                .suite_position
                .map_or_else(|| "-".to_string(), |position| position.to_string());
            format!(
                "test,{},{},{position}",
                registration.name,
                registration.kind.as_str()
            )
        })
        .collect()
}

fn parse_trace(raw: &str) -> Result<Vec<TraceEvent>> {
    let mut out = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        let line_no = line_no + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("kind,") {
            continue;
        }

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        let event = match parts.as_slice() {
            [kind @ ("accel" | "gyro"), ms, x, y, z] => TraceEvent::Sample {
                channel: if *kind == "accel" {
                    SensorChannel::Accel
                } else {
                    SensorChannel::Gyro
                },
                sample: Sample::new(
                    parse_field(ms, line_no, "ms")?,
                    parse_field(x, line_no, "x")?,
                    parse_field(y, line_no, "y")?,
                    parse_field(z, line_no, "z")?,
                ),
            },
            ["step", ms, matched] => TraceEvent::Step {
                ms: parse_field(ms, line_no, "ms")?,
                matched: parse_flag(matched, line_no)?,
            },
            ["external", ms, score, abnormal] => TraceEvent::External {
                ms: parse_field(ms, line_no, "ms")?,
                score: parse_field(score, line_no, "score")?,
                abnormal: parse_flag(abnormal, line_no)?,
            },
            _ => bail!("line {line_no}: unrecognised trace line '{trimmed}'"),
        };
        out.push(event);
    }
    Ok(out)
}

fn parse_field<T>(raw: &str, line_no: usize, field: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow::anyhow!("line {line_no}: invalid {field} '{raw}': {err}"))
}

fn parse_flag(raw: &str, line_no: usize) -> Result<bool> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => bail!("line {line_no}: expected 0 or 1, got '{raw}'"),
    }
}

// Starts the test at t=0 and feeds the trace in order. Timestamps are
// relative to that start, so samples recorded before the countdown ends are
// not delivered.
fn replay(
    profile: TestProfile,
    difficulty: Option<u8>,
    events: &[TraceEvent],
) -> Result<Vec<String>> {
    let end_ms = profile
        .countdown_ms
        .saturating_add(profile.effective_capture_ms());
    let sensor = ManualSensor::new();
    let mut controller =
        TestController::with_difficulty(profile, difficulty, Box::new(sensor.clone()));
    let mut lines = Vec::new();

    report(&mut lines, &controller.start(0));
    for event in events {
        if controller.result().is_some() {
            break;
        }
        report(&mut lines, &controller.tick(event.ms()));
        let output = match *event {
            TraceEvent::Sample { channel, sample } => {
                if !sensor.push(channel, sample) {
                    log::debug!(
                        "{} sample at {}ms not delivered",
                        channel.as_str(),
                        sample.timestamp_ms
                    );
                }
                continue;
            }
            TraceEvent::Step { ms, matched } => controller.observe_step(ms, matched),
            TraceEvent::External {
                ms,
                score,
                abnormal,
            } => controller.submit_external(ms, score, abnormal),
        };
        report(&mut lines, &output);
    }
    if controller.result().is_none() {
        let last_ms = events.last().map_or(0, TraceEvent::ms);
        report(&mut lines, &controller.tick(end_ms.max(last_ms)));
    }

    if controller.result().is_none() {
        bail!("replay ended without a result");
    }
    Ok(lines)
}

fn report(lines: &mut Vec<String>, output: &ControllerOutput) {
    for action in &output.actions {
        match action {
            ControllerAction::StepAdvanced {
                index,
                direction,
                matched,
            } => lines.push(format!(
                "step,{index},{},{}",
                direction.label(),
                u8::from(*matched)
            )),
            _ => {}
        }
    }
    if let Some(result) = output.completed() {
        lines.push(format!(
            "result,{},{:.3},{},{},{}",
            result.test_name,
            result.verdict.score,
            result.verdict.is_abnormal,
            result.data_source.as_str(),
            result.verdict.reason.label()
        ));
    }
}
