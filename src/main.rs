use std::{
    net::{SocketAddr, TcpListener},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
    thread,
    time::Duration,
};

use classdhcp6::{
    addrclass::ClassIdAllocator,
    config::Config,
    leasedb::LeaseDb,
    logging::{self, LogFormat},
    mgmt::{self, Reloader},
    PolicyEngine,
};
use tracing::{error, info, Level};

const HELP: &str = "\
classdhcp6: DHCPv6 address class policy daemon

USAGE:
  classdhcp6 [OPTIONS]

OPTIONS:
  --config-dir DIR     directory holding config.json [default: .]
  --mgmt ADDR          management listener address [default: 127.0.0.1:8547]
  --log-level LEVEL    overrides log_level from config.json
  --log-format FORMAT  text or json [default: text]
  --check              validate the configuration and exit
  -h, --help           print this help
";

const DEFAULT_MGMT: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
    std::net::Ipv4Addr::LOCALHOST,
    8547,
));
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

struct Args {
    config_dir: PathBuf,
    mgmt: SocketAddr,
    log_level: Option<Level>,
    log_format: LogFormat,
    check: bool,
}

fn parse_args() -> Result<Option<Args>, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        return Ok(None);
    }

    let args = Args {
        config_dir: pargs
            .opt_value_from_str("--config-dir")?
            .unwrap_or_else(|| PathBuf::from(".")),
        mgmt: pargs.opt_value_from_str("--mgmt")?.unwrap_or(DEFAULT_MGMT),
        log_level: pargs.opt_value_from_str("--log-level")?,
        log_format: pargs.opt_value_from_str("--log-format")?.unwrap_or_default(),
        check: pargs.contains("--check"),
    };

    let rest = pargs.finish();
    if !rest.is_empty() {
        return Err(pico_args::Error::ArgumentParsingFailed {
            cause: format!("unexpected arguments: {rest:?}"),
        });
    }
    Ok(Some(args))
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{HELP}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("error: {e}\n\n{HELP}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&args.config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let level = args
        .log_level
        .or_else(|| config.log_level())
        .unwrap_or(Level::INFO);
    logging::init_stdout(args.log_format, level);

    let mut ids = ClassIdAllocator::new();
    let table = match config.build(&mut ids) {
        Ok(table) => table,
        Err(e) => {
            error!(%e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if args.check {
        info!(
            interfaces = table.interfaces().len(),
            classes = table.class_count(),
            "configuration ok"
        );
        return ExitCode::SUCCESS;
    }

    let engine = Arc::new(PolicyEngine::new(table));
    let leases = Arc::new(LeaseDb::new());
    let reloader = Arc::new(Reloader::new(
        engine.clone(),
        leases.clone(),
        ids,
        args.config_dir,
    ));

    let mgmt_listener = match TcpListener::bind(args.mgmt) {
        Ok(listener) => listener,
        Err(e) => {
            error!(%e, addr = %args.mgmt, "failed to bind management listener");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %args.mgmt, "management listener started");

    let _cleanup = leases.spawn_cleanup_thread(engine, CLEANUP_INTERVAL);
    #[cfg(unix)]
    let _sighup = classdhcp6::signal::spawn_sighup_handler(reloader.clone());

    let mgmt = thread::Builder::new()
        .name("mgmt".to_string())
        .spawn(move || mgmt::listener(mgmt_listener, reloader))
        .expect("mgmt spawn");
    let _ = mgmt.join();

    ExitCode::SUCCESS
}
