use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use dns_stub::{Config, ConfigLoader, Record, RecordType, StubResolver, UnixConfigLoader};

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS stub lookup utility
///
/// Forwards the question to a recursive nameserver - either the system
/// ones from resolv.conf, or the servers given with --nameserver.
struct Args {
    /// Name to resolve
    #[clap(value_parser)]
    name: String,

    /// Record type to query, by mnemonic ('A', 'MX', ...) or number; omit
    /// to look up both address families
    #[clap(value_parser = parse_record_type)]
    qtype: Option<RecordType>,

    /// Nameserver to ask, in `ip` or `ip:port` form; can be given more
    /// than once
    #[clap(short, long, value_parser = parse_nameserver)]
    nameserver: Vec<SocketAddr>,

    /// Per-attempt timeout, in milliseconds
    #[clap(long, value_parser)]
    timeout_ms: Option<u64>,

    /// Total attempts across the nameserver rotation
    #[clap(long, value_parser)]
    attempts: Option<usize>,
}

fn parse_record_type(s: &str) -> Result<RecordType, String> {
    if let Ok(rtype) = s.to_ascii_uppercase().parse::<RecordType>() {
        return Ok(rtype);
    }
    if let Ok(value) = s.parse::<u16>() {
        return Ok(RecordType::from(value));
    }
    Err(format!("unknown record type '{s}'"))
}

fn parse_nameserver(s: &str) -> Result<SocketAddr, String> {
    if let Ok(address) = s.parse::<SocketAddr>() {
        return Ok(address);
    }
    if let Ok(address) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(address, 53));
    }
    Err(format!("'{s}' is not a nameserver address"))
}

fn print_answers(records: &[Record]) {
    println!("\n;; ANSWER");
    for record in records {
        match record.ttl {
            Some(ttl) => println!("{ttl}\t{}\t{}", record.rtype, record.data),
            None => println!("-\t{}\t{}", record.rtype, record.data),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = if args.nameserver.is_empty() {
        match UnixConfigLoader::new().load().await {
            Ok(config) => config,
            Err(error) => {
                eprintln!("could not load system configuration: {error}");
                process::exit(1);
            }
        }
    } else {
        match Config::new(args.nameserver.clone()) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("{error}");
                process::exit(1);
            }
        }
    };

    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(attempts) = args.attempts {
        config = config.with_attempts(attempts);
    }

    let resolver = StubResolver::with_config(config);

    println!(";; QUESTION");
    match args.qtype {
        Some(qtype) => println!("{}\t{qtype}", args.name),
        None => println!("{}\tA + AAAA", args.name),
    }

    let result = match args.qtype {
        None => resolver.resolve(&args.name, None).await,
        Some(qtype) if qtype == RecordType::A || qtype == RecordType::AAAA => {
            resolver.resolve(&args.name, Some(qtype)).await
        }
        Some(qtype) => resolver.query(&args.name, qtype).await,
    };

    match result {
        Ok(records) => print_answers(&records),
        Err(error) => {
            println!("\n;; ANSWER");
            println!("; {error}");
            process::exit(1);
        }
    }
}
