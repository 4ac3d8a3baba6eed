//! Runs one client through the address class policy of a configuration
//! without touching the network: selection, lifetime negotiation and an
//! address draw.

use std::{net::Ipv6Addr, path::PathBuf, process::ExitCode};

use classdhcp6::{
    addrclass::ClassIdAllocator, config::Config, extensions::PolicyMessageExtV6,
    leasedb::LeaseDb, ClientRequest, Duid, PolicyEngine,
};
use dhcproto::v6;

const HELP: &str = "\
probe: show which address class and lifetimes a client would get

USAGE:
  probe --iface NAME --duid HEX [OPTIONS]

OPTIONS:
  --config-dir DIR            directory holding config.json [default: .]
  --addr ADDR                 address hint placed in IA_NA
  --vendor ENTERPRISE:DATA    Vendor Class option
  --user-class DATA           User Class option
  --t1 SECS --t2 SECS         requested IA_NA timers
  --pref SECS --valid SECS    requested address lifetimes
";

struct Args {
    config_dir: PathBuf,
    iface: String,
    duid: Duid,
    addr: Option<Ipv6Addr>,
    vendor: Option<(u32, Vec<u8>)>,
    user_class: Option<String>,
    t1: u32,
    t2: u32,
    preferred: u32,
    valid: u32,
}

fn parse_duid(s: &str) -> Result<Duid, String> {
    Duid::parse(s).ok_or_else(|| format!("invalid duid `{s}`"))
}

fn parse_vendor(s: &str) -> Result<(u32, Vec<u8>), String> {
    let (enterprise, data) = s
        .split_once(':')
        .ok_or_else(|| format!("expected ENTERPRISE:DATA, got `{s}`"))?;
    let enterprise = enterprise
        .parse()
        .map_err(|e| format!("invalid enterprise number `{enterprise}`: {e}"))?;
    Ok((enterprise, data.as_bytes().to_vec()))
}

fn parse_args() -> Result<Option<Args>, pico_args::Error> {
    let mut pargs = pico_args::Arguments::from_env();
    if pargs.contains(["-h", "--help"]) {
        return Ok(None);
    }

    Ok(Some(Args {
        config_dir: pargs
            .opt_value_from_str("--config-dir")?
            .unwrap_or_else(|| PathBuf::from(".")),
        iface: pargs.value_from_str("--iface")?,
        duid: pargs.value_from_fn("--duid", parse_duid)?,
        addr: pargs.opt_value_from_str("--addr")?,
        vendor: pargs.opt_value_from_fn("--vendor", parse_vendor)?,
        user_class: pargs.opt_value_from_str("--user-class")?,
        t1: pargs.opt_value_from_str("--t1")?.unwrap_or(0),
        t2: pargs.opt_value_from_str("--t2")?.unwrap_or(0),
        preferred: pargs.opt_value_from_str("--pref")?.unwrap_or(0),
        valid: pargs.opt_value_from_str("--valid")?.unwrap_or(0),
    }))
}

fn solicit(args: &Args) -> v6::Message {
    // construct a new Solicit Message with a random xid
    let mut msg = v6::Message::new(v6::MessageType::Solicit);
    let opts = msg.opts_mut();
    opts.insert(v6::DhcpOption::ClientId(args.duid.bytes.clone()));

    let mut ia_opts = v6::DhcpOptions::new();
    ia_opts.insert(v6::DhcpOption::IAAddr(v6::IAAddr {
        addr: args.addr.unwrap_or(Ipv6Addr::UNSPECIFIED),
        preferred_life: args.preferred,
        valid_life: args.valid,
        opts: v6::DhcpOptions::new(),
    }));
    opts.insert(v6::DhcpOption::IANA(v6::IANA {
        id: 1,
        t1: args.t1,
        t2: args.t2,
        opts: ia_opts,
    }));

    if let Some((num, data)) = &args.vendor {
        opts.insert(v6::DhcpOption::VendorClass(v6::VendorClass {
            num: *num,
            data: vec![data.clone()],
        }));
    }
    if let Some(data) = &args.user_class {
        opts.insert(v6::DhcpOption::UserClass(v6::UserClass {
            data: vec![data.as_bytes().to_vec()],
        }));
    }
    msg
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

    let table = match Config::load(&args.config_dir)
        .and_then(|config| config.build(&mut ClassIdAllocator::new()))
    {
        Ok(table) => table,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = PolicyEngine::new(table);

    let msg = solicit(&args);
    println!("msg: {msg}");
    let Some(req) = ClientRequest::from_message(&msg) else {
        eprintln!("error: message carries no client identifier");
        return ExitCode::FAILURE;
    };

    let class = match engine.select_class(&args.iface, &req) {
        Ok(class) => class,
        Err(e) => {
            println!("refused: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("class: {class}");

    let requested = msg.requested_lifetimes();
    let lifetimes = match engine.negotiate(class, &requested) {
        Ok(lifetimes) => lifetimes,
        Err(e) => {
            println!("refused: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("requested: {requested}");
    println!("negotiated: {lifetimes}");

    match LeaseDb::new().lease(&engine, class, &req, lifetimes) {
        Ok(addr) => println!("address: {addr}"),
        Err(e) => {
            println!("refused: {e}");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
