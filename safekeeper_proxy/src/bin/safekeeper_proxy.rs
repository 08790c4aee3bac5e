//
// Main entry point for the safekeeper_proxy executable
//
use std::env;
use std::io::{self, Write};
use std::process::exit;

use anyhow::{anyhow, bail, Context, Result};
use clap::{App, Arg, ArgMatches};
use rand::RngCore;
use tracing::*;

use safekeeper_proxy::broadcast::Broadcaster;
use safekeeper_proxy::protocol::{NodeId, ServerInfo, SK_PROTOCOL_VERSION};
use safekeeper_proxy::walreceiver::WalReceiver;
use safekeeper_proxy::{defaults, parse_safekeepers_list, validate_quorum, SafekeeperProxyConf};

fn main() {
    let arg_matches = App::new("safekeeper_proxy")
        .about("Receive streaming write-ahead logs from PostgreSQL and broadcast them to safekeepers")
        .version(env!("CARGO_PKG_VERSION"))
        // keep -h free for the server host, like other Postgres tools
        .help_short("?")
        .arg(
            Arg::with_name("safekeepers")
                .short("s")
                .long("safekeepers")
                .takes_value(true)
                .required(true)
                .help("comma separated list of safekeepers in format 'host1:port1,host2:port2'"),
        )
        .arg(
            Arg::with_name("quorum")
                .short("q")
                .long("quorum")
                .takes_value(true)
                .help("quorum for sending response to server (default: majority)"),
        )
        .arg(
            Arg::with_name("dbname")
                .short("d")
                .long("dbname")
                .takes_value(true)
                .help("connection string"),
        )
        .arg(
            Arg::with_name("host")
                .short("h")
                .long("host")
                .takes_value(true)
                .help("database server host"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("database server port number"),
        )
        .arg(
            Arg::with_name("username")
                .short("U")
                .long("username")
                .takes_value(true)
                .help("connect as specified database user"),
        )
        .arg(
            Arg::with_name("no-password")
                .short("w")
                .long("no-password")
                .conflicts_with("password")
                .help("never prompt for password"),
        )
        .arg(
            Arg::with_name("password")
                .short("W")
                .long("password")
                .help("force password prompt"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("output verbose messages"),
        )
        .get_matches();

    // Initialize logger
    let default_filter = if arg_matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let conf = match build_conf(&arg_matches) {
        Ok(conf) => conf,
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    };

    if let Err(e) = run(conf) {
        error!("{:#}", e);
        exit(1);
    }
}

/// Resolve the configuration from flags, the connection string and the
/// usual libpq environment variables, in that order of preference.
fn build_conf(matches: &ArgMatches) -> Result<SafekeeperProxyConf> {
    let safekeepers = parse_safekeepers_list(matches.value_of("safekeepers").unwrap())?;

    let quorum = match matches.value_of("quorum") {
        Some(q) => Some(
            q.parse::<usize>()
                .map_err(|_| anyhow!("invalid quorum value \"{}\"", q))?,
        ),
        None => None,
    };
    let quorum = validate_quorum(safekeepers.len(), quorum)?;

    let pg_config = match matches.value_of("dbname") {
        Some(connstr) => connstr
            .parse::<postgres::Config>()
            .with_context(|| format!("invalid connection string \"{}\"", connstr))?,
        None => postgres::Config::new(),
    };

    let mut host = match pg_config.get_hosts().first() {
        Some(postgres::config::Host::Tcp(h)) => Some(h.clone()),
        Some(postgres::config::Host::Unix(_)) => bail!("unix socket connections are not supported"),
        None => None,
    };
    let mut port = pg_config.get_ports().first().copied();
    let mut user = pg_config.get_user().map(|u| u.to_owned());
    let password = pg_config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).into_owned());

    if let Some(h) = matches.value_of("host") {
        host = Some(h.to_owned());
    }
    if let Some(p) = matches.value_of("port") {
        match p.parse::<u16>() {
            Ok(n) if n > 0 => port = Some(n),
            _ => bail!("invalid port number \"{}\"", p),
        }
    }
    if let Some(u) = matches.value_of("username") {
        user = Some(u.to_owned());
    }

    let host = host
        .or_else(|| env::var("PGHOST").ok())
        .unwrap_or_else(|| defaults::DEFAULT_PG_HOST.to_owned());
    let port = match port {
        Some(p) => p,
        None => match env::var("PGPORT") {
            Ok(p) => p
                .parse()
                .map_err(|_| anyhow!("invalid PGPORT \"{}\"", p))?,
            Err(_) => defaults::DEFAULT_PG_PORT,
        },
    };
    let user = user
        .or_else(|| env::var("PGUSER").ok())
        .or_else(|| env::var("USER").ok())
        .ok_or_else(|| anyhow!("no user name specified and none could be inferred"))?;

    let mut password = password.or_else(|| env::var("PGPASSWORD").ok());
    if matches.is_present("password") {
        password = Some(prompt_password()?);
    }

    Ok(SafekeeperProxyConf {
        safekeepers,
        quorum,
        host,
        port,
        user,
        password,
    })
}

fn prompt_password() -> Result<String> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(&['\r', '\n'][..]).to_owned())
}

fn run(conf: SafekeeperProxyConf) -> Result<()> {
    let mut primary = WalReceiver::connect(&conf)?;

    // Make sure we really hold a replication session and learn where
    // the server's WAL currently ends.
    let ident = primary.identify_system()?;
    if let Some(dbname) = &ident.dbname {
        bail!(
            "replication connection is unexpectedly database specific (dbname {})",
            dbname
        );
    }
    let wal_seg_size = primary.wal_seg_size()?;
    let pg_version = primary.server_version_num()?;
    info!(
        "server system {} version {} timeline {} wal end {}",
        ident.system_id, pg_version, ident.timeline, ident.xlogpos
    );

    let mut uuid = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut uuid);
    let server_info = ServerInfo {
        protocol_version: SK_PROTOCOL_VERSION,
        pg_version,
        system_id: ident.system_id,
        wal_seg_size,
        timeline: ident.timeline,
        wal_end: ident.xlogpos,
        node_id: NodeId { term: 0, uuid },
    };

    let mut broadcaster = Broadcaster::new(conf.safekeepers, conf.quorum, server_info)?;
    broadcaster.run(&mut primary)
}
