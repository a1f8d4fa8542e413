use clap::{value_parser, Arg, Command, ValueHint};
use prophet_cli::input::Input;
use prophet_cli::runner::Runner;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Error)
        .parse_env(env_logger::Env::default().filter_or("PROPHET_LOG", "error,prophet=info"))
        .init();

    let matches = Command::new("prophet")
        .version(clap::crate_version!())
        .about("Semi-supervised scoring and FDR estimation for targeted proteomics")
        .arg(
            Arg::new("parameters")
                .required(true)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Path to configuration parameters (JSON file)")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("input_paths")
                .num_args(1..)
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Paths to tab-separated peak group tables. Overrides input files listed in \
                     the configuration file.",
                )
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("output_directory")
                .short('o')
                .long("output_directory")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help(
                    "Path where scored tables will be written. \
                     Overrides the directory specified in the configuration file.",
                )
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i32).range(-1..))
                .help("Number of worker threads, -1 to use all available processing units")
                .value_hint(ValueHint::Other),
        )
        .arg(
            Arg::new("apply-weights")
                .long("apply-weights")
                .value_parser(clap::builder::NonEmptyStringValueParser::new())
                .help("Score with previously learned weights (JSON file) instead of learning")
                .value_hint(ValueHint::FilePath),
        )
        .arg(
            Arg::new("test")
                .long("test")
                .action(clap::ArgAction::SetTrue)
                .help("Fix the random seed for reproducible output"),
        )
        .help_template(
            "{usage-heading} {usage}\n\n\
             {about-with-newline}\n\
             Version {version}\n\n\
             {all-args}{after-help}",
        )
        .get_matches();

    let input = Input::from_arguments(matches)?;

    let runner = input.build().and_then(Runner::new)?;
    runner.run()?;

    Ok(())
}
