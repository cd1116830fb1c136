use bitcoin_peers_network::{ChannelEvent, P2p, Settings};
use clap::Parser;
use log::LevelFilter;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Peers to connect to and keep connected, as host:port.
    #[arg(short, long)]
    peer: Vec<String>,

    /// Seed endpoints used to bootstrap the address pool, as host:port.
    #[arg(short, long)]
    seed: Vec<String>,

    /// Number of outbound connections to maintain.
    #[arg(short, long, default_value_t = 0)]
    outbound: usize,

    /// Accept inbound connections on this port.
    #[arg(short, long)]
    listen: Option<u16>,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log: LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    TermLogger::init(
        args.log,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let mut settings = Settings::default();
    settings.peers = args.peer;
    settings.seeds = args.seed;
    settings.outbound_connections = args.outbound;
    if let Some(port) = args.listen {
        settings.inbound_enabled = true;
        settings.inbound_port = port;
    }

    let network = P2p::new(settings);
    network.start().await?;

    network.subscribe(Box::new(|event| {
        match event {
            Ok(ChannelEvent::Connect(channel)) => println!("connected: {channel}"),
            Ok(ChannelEvent::Stop(channel)) => println!("disconnected: {channel}"),
            Err(_) => return false,
        }
        true
    }))?;

    network.run().await?;

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    network.close().await;

    Ok(())
}
