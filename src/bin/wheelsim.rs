use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use std::fs;
use tracing::Level;
use wheelsim::{
    run_headless, verify_replay, DiscObstacle, EmulatorConfig, HeldController, LimitReason,
    PointField, Recording, RecordingSink, RunSummary, SimulationLoop, Snapshot, WheelchairState,
};

const DEFAULT_DURATION_S: &str = "10";
const DEFAULT_OBSTACLE_RADIUS_M: &str = "0.1";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("wheelsim")
        .version("0.1.0")
        .author("Mobility Systems Engineering Team")
        .about("Wheelchair control and safety loop simulator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file; missing fields use defaults")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log loop and safety events")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run the loop headless with a held stick position")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .takes_value(true)
                        .default_value(DEFAULT_DURATION_S)
                        .validator(positive_number),
                )
                .arg(
                    Arg::with_name("seed")
                        .short("s")
                        .long("seed")
                        .value_name("SEED")
                        .takes_value(true)
                        .validator(|v| {
                            v.parse::<u64>()
                                .map(|_| ())
                                .map_err(|_| "Seed must be an unsigned integer".to_string())
                        }),
                )
                .arg(
                    Arg::with_name("linear")
                        .long("linear")
                        .value_name("M/S")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("0.5")
                        .validator(number),
                )
                .arg(
                    Arg::with_name("angular")
                        .long("angular")
                        .value_name("RAD/S")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("0.0")
                        .validator(number),
                )
                .arg(
                    Arg::with_name("obstacle")
                        .long("obstacle")
                        .value_name("X,Y")
                        .help("Point obstacle; may be repeated")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .allow_hyphen_values(true)
                        .validator(|v| parse_point(&v).map(|_| ())),
                )
                .arg(
                    Arg::with_name("obstacle-radius")
                        .long("obstacle-radius")
                        .value_name("METRES")
                        .takes_value(true)
                        .default_value(DEFAULT_OBSTACLE_RADIUS_M)
                        .validator(positive_number),
                )
                .arg(
                    Arg::with_name("record")
                        .short("r")
                        .long("record")
                        .value_name("FILE")
                        .help("Write a JSON-lines recording of every snapshot")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("replay")
                .about("Re-run a recording and verify it is bit-identical")
                .arg(
                    Arg::with_name("input")
                        .help("Recording produced by `run --record`")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("config")
                .about("Validate a configuration and print the effective limits"),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else {
        Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let format = matches.value_of("format").unwrap_or("table");
    let config = load_config(matches.value_of("config"))?;

    match matches.subcommand() {
        ("run", Some(sub)) => handle_run(sub, config, format),
        ("replay", Some(sub)) => handle_replay(sub, format),
        ("config", Some(_)) => handle_config(&config, format),
        _ => {
            println!("{}", "wheelsim - Wheelchair Control Simulator".bright_blue().bold());
            println!("Use --help to see the available commands");
            Ok(())
        }
    }
}

fn number(v: String) -> Result<(), String> {
    v.parse::<f64>()
        .ok()
        .filter(|x| x.is_finite())
        .map(|_| ())
        .ok_or_else(|| format!("'{v}' is not a finite number"))
}

fn positive_number(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(x) if x.is_finite() && x > 0.0 => Ok(()),
        _ => Err(format!("'{v}' must be a positive number")),
    }
}

fn parse_point(v: &str) -> Result<(f64, f64), String> {
    let mut parts = v.split(',').map(|p| p.trim().parse::<f64>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) if x.is_finite() && y.is_finite() => Ok((x, y)),
        _ => Err(format!("'{v}' is not an X,Y pair")),
    }
}

fn load_config(path: Option<&str>) -> Result<EmulatorConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            Ok(EmulatorConfig::from_json(&text)?)
        }
        None => Ok(EmulatorConfig::default()),
    }
}

fn handle_run(
    matches: &ArgMatches<'_>,
    mut config: EmulatorConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(seed) = matches.value_of("seed") {
        config.simulation.seed = seed.parse()?;
    }
    let duration: f64 = matches.value_of("duration").unwrap_or(DEFAULT_DURATION_S).parse()?;
    let linear: f64 = matches.value_of("linear").unwrap_or("0").parse()?;
    let angular: f64 = matches.value_of("angular").unwrap_or("0").parse()?;
    let radius: f64 = matches
        .value_of("obstacle-radius")
        .unwrap_or(DEFAULT_OBSTACLE_RADIUS_M)
        .parse()?;

    let mut obstacles = PointField::default();
    for point in matches.values_of("obstacle").into_iter().flatten() {
        let (x, y) = parse_point(point)?;
        obstacles.push(DiscObstacle::new(x, y, radius));
    }

    let ticks = (duration * config.simulation.update_rate).round() as u64;
    let mut sim = SimulationLoop::emulated(config.clone(), obstacles.clone())?;
    sim.set_controller(HeldController::new(linear, angular));

    let recorder = RecordingSink::new();
    let handle = recorder.handle();
    sim.add_sink(recorder);

    let summary = run_headless(&mut sim, ticks);
    let snapshots = handle.take();

    print_run(&summary, &snapshots, &config, format)?;

    if let Some(path) = matches.value_of("record") {
        Recording::new(config, obstacles, WheelchairState::default())
            .with_snapshots(snapshots)
            .save(path)?;
        if format != "json" {
            println!("{} Recording written to {}", "✅".green(), path.bright_white());
        }
    }

    Ok(())
}

fn handle_replay(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("input").unwrap_or_default();
    let recording = Recording::load(path)?;

    match verify_replay(&recording) {
        Ok(verified) => {
            match format {
                "json" => println!(
                    "{}",
                    serde_json::json!({ "verified": verified, "matched": true })
                ),
                _ => println!(
                    "{} Replay matched {} snapshots",
                    "✅".green(),
                    verified.to_string().bright_cyan()
                ),
            }
            Ok(())
        }
        Err(e) => {
            match format {
                "json" => println!(
                    "{}",
                    serde_json::json!({ "matched": false, "error": e.to_string() })
                ),
                _ => println!("{} {}", "❌".red(), e.to_string().bright_red()),
            }
            Err(Box::new(e))
        }
    }
}

fn handle_config(config: &EmulatorConfig, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let limits = config.drive_limits();
    match format {
        "json" => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "config": config,
                "effective_limits": limits,
            }))?
        ),
        _ => {
            println!("{}", "Effective drive limits".bright_blue().bold());
            println!("  linear velocity      {:>6.2} m/s", limits.max_linear_velocity);
            println!("  angular velocity     {:>6.2} rad/s", limits.max_angular_velocity);
            println!("  linear acceleration  {:>6.2} m/s²", limits.max_linear_acceleration);
            println!("  angular acceleration {:>6.2} rad/s²", limits.max_angular_acceleration);
            println!("{}", "Safety".bright_blue().bold());
            println!("  deadman timeout      {:>6.2} s", config.safety.deadman_timeout);
            println!("  obstacle stop        {:>6.2} m", config.safety.obstacle_stop_distance);
            println!("  obstacle slow        {:>6.2} m", config.safety.obstacle_slow_distance);
            println!("  critical charge      {:>6.0} %", config.safety.critical_state_of_charge * 100.0);
            println!("  update rate          {:>6.1} Hz", config.simulation.update_rate);
        }
    }
    Ok(())
}

fn reason_label(reason: LimitReason) -> ColoredString {
    let label = format!("{reason:?}");
    match reason {
        LimitReason::None => label.green(),
        LimitReason::Speed | LimitReason::Acceleration => label.yellow(),
        _ => label.red(),
    }
}

fn print_run(
    summary: &RunSummary,
    snapshots: &[Snapshot],
    config: &EmulatorConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        "json" => {
            let last = snapshots.last();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "summary": summary,
                    "final": last,
                }))?
            );
        }
        "compact" => {
            if let Some(last) = snapshots.last() {
                println!(
                    "t={:.2}s x={:.3} y={:.3} θ={:.3} v={:.3} soc={:.4} limit={}",
                    last.time,
                    last.state.x,
                    last.state.y,
                    last.state.theta,
                    last.state.linear_velocity,
                    last.power.state_of_charge,
                    reason_label(last.safety.active_limit_reason)
                );
            }
        }
        _ => {
            println!("{}", "wheelsim run".bright_blue().bold());
            println!(
                "{:>7} {:>8} {:>8} {:>7} {:>7} {:>7} {:>8}  {}",
                "time", "x", "y", "θ", "v", "ω", "soc", "limit"
            );
            let every = config.simulation.update_rate.round().max(1.0) as u64;
            for s in snapshots.iter().filter(|s| s.tick % every == 0) {
                let soc = format!("{:>7.2}%", s.power.state_of_charge * 100.0);
                let soc = if s.safety.battery_critical { soc.red() } else { soc.normal() };
                println!(
                    "{:>7.2} {:>8.3} {:>8.3} {:>7.3} {:>7.3} {:>7.3} {}  {}",
                    s.time,
                    s.state.x,
                    s.state.y,
                    s.state.theta,
                    s.state.linear_velocity,
                    s.state.angular_velocity,
                    soc,
                    reason_label(s.safety.active_limit_reason)
                );
            }
            let failed = if summary.failed_ticks == 0 {
                "0".green()
            } else {
                summary.failed_ticks.to_string().red()
            };
            println!(
                "\n{} ticks, {:.2} s simulated, {} failed",
                summary.ticks, summary.sim_time, failed
            );
        }
    }
    Ok(())
}
