use clap::{value_parser, Arg, ArgAction, Command};
use engage_sim::{run_simulator, run_stress, SimulatorConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

fn cli() -> Command {
    Command::new("engage-sim")
        .version(engage_core::VERSION)
        .about("Engagement ingestion simulator")
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run seeded lifecycle simulation and check invariants")
                .arg(
                    Arg::new("sessions")
                        .long("sessions")
                        .default_value("100")
                        .value_parser(value_parser!(usize))
                        .help("Number of concurrent sessions"),
                )
                .arg(
                    Arg::new("batches")
                        .long("batches")
                        .default_value("20")
                        .value_parser(value_parser!(usize))
                        .help("Distinct batches per session"),
                )
                .arg(
                    Arg::new("batch-size")
                        .long("batch-size")
                        .default_value("10")
                        .value_parser(value_parser!(usize))
                        .help("Samples per batch"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("duplicate-rate")
                        .long("duplicate-rate")
                        .default_value("0.2")
                        .value_parser(parse_rate)
                        .help("Probability that a batch is resent"),
                )
                .arg(
                    Arg::new("invalid-rate")
                        .long("invalid-rate")
                        .default_value("0.05")
                        .value_parser(parse_rate)
                        .help("Probability that a sample has an out-of-range score"),
                )
                .arg(
                    Arg::new("stop-on-violation")
                        .long("stop-on-violation")
                        .action(ArgAction::SetTrue)
                        .help("Stop checking after the first violation"),
                ),
        )
        .subcommand(
            Command::new("stress")
                .about("Hammer many sessions with duplicated batches")
                .arg(
                    Arg::new("sessions")
                        .long("sessions")
                        .default_value("1000")
                        .value_parser(value_parser!(usize))
                        .help("Number of sessions"),
                )
                .arg(
                    Arg::new("samples")
                        .long("samples")
                        .default_value("500")
                        .value_parser(value_parser!(usize))
                        .help("Samples per session"),
                ),
        )
}

fn parse_rate(value: &str) -> Result<f64, String> {
    let rate: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err("must be within [0, 1]".to_string())
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: *args.get_one::<u64>("seed").unwrap_or(&42),
                sessions: *args.get_one::<usize>("sessions").unwrap_or(&100),
                batches_per_session: *args.get_one::<usize>("batches").unwrap_or(&20),
                batch_size: *args.get_one::<usize>("batch-size").unwrap_or(&10),
                duplicate_rate: *args.get_one::<f64>("duplicate-rate").unwrap_or(&0.2),
                invalid_rate: *args.get_one::<f64>("invalid-rate").unwrap_or(&0.05),
                stop_on_first_violation: args.get_flag("stop-on-violation"),
            };

            println!("Running engage simulator...");
            println!("Sessions: {}", config.sessions);
            println!("Seed: {}", config.seed);
            println!();

            let report = run_simulator(config).await?;
            println!("{}", report.generate_text());
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("stress", args)) => {
            let sessions = *args.get_one::<usize>("sessions").unwrap_or(&1000);
            let samples = *args.get_one::<usize>("samples").unwrap_or(&500);

            println!("Running stress test...");
            println!("Sessions: {}", sessions);
            println!("Samples: {}", samples);
            println!();

            let report = run_stress(sessions, samples).await?;
            println!("Stress Test Report:");
            println!("  Sessions: {}", report.sessions);
            println!("  Samples per session: {}", report.samples);
            println!("  Accepted: {}", report.accepted);
            println!("  Elapsed: {:?}", report.elapsed);
            println!("  Success: {}", report.success);

            std::process::exit(if report.success { 0 } else { 1 });
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        cli().debug_assert();
    }

    #[test]
    fn rate_must_be_a_probability() {
        assert_eq!(parse_rate("0.5"), Ok(0.5));
        assert!(parse_rate("1.5").is_err());
        assert!(parse_rate("abc").is_err());
    }

    #[test]
    fn simulate_parses_flags() {
        let matches = cli()
            .try_get_matches_from(["engage-sim", "simulate", "--sessions", "3", "--seed", "9"])
            .unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "simulate");
        assert_eq!(*args.get_one::<usize>("sessions").unwrap(), 3);
        assert_eq!(*args.get_one::<u64>("seed").unwrap(), 9);
        assert_eq!(*args.get_one::<f64>("duplicate-rate").unwrap(), 0.2);
    }
}
