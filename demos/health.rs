use std::{
    convert::TryFrom,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    str::FromStr,
    time::{Duration, Instant},
};
use swarmdht::{router, InfoHash, LengthError, Mode, SwarmDht};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{self, UdpSocket},
    time,
};

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0));
    let socket = UdpSocket::bind(addr).await.unwrap();

    let mut seeds = Vec::new();
    for router in router::DEFAULT_ROUTERS {
        match net::lookup_host(router).await {
            Ok(addrs) => seeds.extend(addrs.filter(|addr| addr.is_ipv4())),
            Err(error) => println!("failed to resolve {}: {}", router, error),
        }
    }

    let dht = SwarmDht::builder().start(socket).unwrap();
    dht.bootstrap(seeds).await.unwrap();

    println!("bootstrapping...");
    let start = Instant::now();

    loop {
        let stats = dht.stats().await.unwrap();

        if stats.mode == Mode::Normal {
            let elapsed = start.elapsed();
            println!(
                "bootstrap completed with {} nodes in {}.{:03} seconds",
                stats.main_size,
                elapsed.as_secs(),
                elapsed.subsec_millis()
            );
            break;
        }

        time::sleep(Duration::from_millis(500)).await;
    }

    let mut stdout = io::stdout();
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();

    loop {
        stdout.write_all(b"> ").await.unwrap();
        stdout.flush().await.unwrap();

        line.clear();

        if stdin.read_line(&mut line).await.unwrap() == 0 || !handle_command(&dht, &line).await {
            break;
        }
    }

    dht.shutdown().await;
}

async fn handle_command(dht: &SwarmDht, command: &str) -> bool {
    match command.parse() {
        Ok(Command::Help) => {
            println!("    h               shows this help message");
            println!("    c <INFO_HASH>   estimate seeders and leechers of the info hash");
            println!("    s               routing table statistics");
            println!("    q               quit");
        }
        Ok(Command::Check(info_hash)) => {
            println!("checking {:?}...", info_hash);

            let start = Instant::now();

            match dht.check_health(info_hash, None).await {
                Ok(result) => {
                    let elapsed = start.elapsed();
                    println!(
                        "{} seeders, {} leechers ({}.{:03} seconds)",
                        result.seeders,
                        result.leechers,
                        elapsed.as_secs(),
                        elapsed.subsec_millis()
                    );
                }
                Err(error) => {
                    println!("check failed: {}", error);
                    return false;
                }
            }
        }
        Ok(Command::Stats) => match dht.stats().await {
            Ok(stats) => println!(
                "main: {}, replacement: {}, mode: {:?}",
                stats.main_size, stats.replacement_size, stats.mode
            ),
            Err(_) => return false,
        },
        Ok(Command::Quit) => return false,
        Err(_) => println!("invalid command (use 'h' for help)"),
    }

    true
}

enum Command {
    Help,
    Check(InfoHash),
    Stats,
    Quit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        match s.get(..1) {
            Some("h") | Some("?") => Ok(Self::Help),
            Some("c") => Ok(Self::Check(parse_info_hash(s[1..].trim())?)),
            Some("s") => Ok(Self::Stats),
            Some("q") => Ok(Self::Quit),
            _ => Err(ParseError),
        }
    }
}

struct ParseError;

impl From<hex::FromHexError> for ParseError {
    fn from(_: hex::FromHexError) -> Self {
        ParseError
    }
}

impl From<LengthError> for ParseError {
    fn from(_: LengthError) -> Self {
        ParseError
    }
}

fn parse_info_hash(s: &str) -> Result<InfoHash, ParseError> {
    Ok(InfoHash::try_from(hex::decode(s)?.as_ref())?)
}
