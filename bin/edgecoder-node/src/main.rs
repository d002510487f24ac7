//! The EdgeCoder unified agent node.

use argh::FromArgs;
use edgecoder_common::logging;
use edgecoder_config::ConfigError;

mod adapters;
mod args;
mod auth;
mod node;
mod peer_client;
mod rpc_server;
mod worker;

// Exit codes for operators and wrappers.
const EXIT_MISCONFIGURATION: i32 = 2;
const EXIT_USAGE: i32 = 64;
const EXIT_UPSTREAM: i32 = 69;
const EXIT_INTERNAL: i32 = 70;

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let strs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let args = match args::Args::from_args(&strs[..1], &strs[1..]) {
        Ok(args) => args,
        Err(exit) => {
            if exit.status.is_ok() {
                println!("{}", exit.output);
                std::process::exit(0);
            }
            eprintln!("{}", exit.output);
            std::process::exit(EXIT_USAGE);
        }
    };

    logging::init(logging::LoggerConfig::with_base_name("edgecoder-node"));

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("FATAL: failed to start runtime: {err}");
            std::process::exit(EXIT_INTERNAL);
        }
    };

    if let Err(err) = runtime.block_on(node::launch(args)) {
        eprintln!("FATAL: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_MISCONFIGURATION;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return EXIT_UPSTREAM;
            }
        }
    }
    EXIT_INTERNAL
}
