// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use meshchain::{server::excluded_prefixes::DEFAULT_PREFIXES_PATH, util};
use std::path::PathBuf;

use util::validators::{
  parse_cross_connect, parse_url, validate_cross_connect, validate_existing_file, validate_url,
};

mod prefixes;
mod simulate;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("meshchain=info,warn"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("prefixes")
        .about("Load an excluded prefix file and print the prefixes it contains")
        .arg(
          Arg::new("file")
            .long("file")
            .short('f')
            .takes_value(true)
            .default_value(DEFAULT_PREFIXES_PATH),
        ),
    )
    .subcommand(
      Command::new("simulate")
        .about("Interpose a connection through in-process cross-connect endpoints and print monitor events")
        .arg(
          Arg::new("name")
            .long("name")
            .short('n')
            .takes_value(true)
            .default_value("nsc-endpoint"),
        )
        .arg(
          Arg::new("upstream")
            .long("upstream")
            .short('u')
            .help("Address the client selected before interposition")
            .validator(validate_url)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("cross-connect")
            .long("cross-connect")
            .short('x')
            .help("Cross-connect endpoint to register, as name=url; may be repeated")
            .validator(validate_cross_connect)
            .takes_value(true)
            .multiple_occurrences(true)
            .required(true),
        )
        .arg(
          Arg::new("accept")
            .long("accept")
            .short('a')
            .help("The only cross-connect endpoint which accepts connections; all accept when omitted")
            .takes_value(true),
        )
        .arg(
          Arg::new("prefixes")
            .long("prefixes")
            .short('p')
            .help("Excluded prefix file applied to the simulated connection")
            .validator(validate_existing_file)
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::debug!("{} exited successfully", mode),
  }
}

pub fn simulate_arg_handling(args: &'_ ArgMatches) -> Result<simulate::SimulateArgs> {
  let cross_connects = args
    .values_of("cross-connect")
    .into_iter()
    .flatten()
    .map(parse_cross_connect)
    .collect::<Result<Vec<_>>>()?;
  Ok(simulate::SimulateArgs {
    name: args.value_of("name").unwrap_or("nsc-endpoint").into(),
    upstream: parse_url(args.value_of("upstream").unwrap_or_default())?,
    cross_connects,
    accept: args.value_of("accept").map(String::from),
    prefixes: args.value_of("prefixes").map(PathBuf::from),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("prefixes", opts)) => {
      let path = PathBuf::from(opts.value_of("file").unwrap_or(DEFAULT_PREFIXES_PATH));
      prefixes::prefixes_main(path).await
    }
    Some(("simulate", opts)) => {
      let config = simulate_arg_handling(opts)?;
      tracing::debug!("Running simulation with config {:#?}", config);
      simulate::simulate_main(config).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
