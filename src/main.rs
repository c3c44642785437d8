use std::time::Duration;

use clap::Parser;
use time::macros::format_description;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use torrentwire::config::DEFAULT_PORT;
use torrentwire::{
    discover_peers, parse_torrent, ClientConfig, MetaInfo, PeerConnection, PeerEvent, TrackerClient, WireMessage,
};

#[derive(Parser, Debug)]
#[command(name = "torrentwire", version)]
struct Args {
    #[arg(short, long, help = "Print contents of torrent file")]
    inspect: bool,

    #[arg(short, long, help = "Query swarm statistics from every tracker that supports scraping")]
    scrape: bool,

    #[arg(long, default_value_t = 5, help = "Maximum number of peers to connect to")]
    peers: usize,

    #[arg(long, default_value_t = 30, help = "Seconds to stay connected before stopping")]
    seconds: u64,

    #[arg(short, long, default_value_t = DEFAULT_PORT, help = "Port reported to trackers")]
    port: u16,

    #[arg(long, default_value = "logs", help = "Directory for the log file")]
    log_dir: String,

    file: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, "torrentwire.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    tracing_subscriber::fmt().with_writer(non_blocking).with_ansi(false).with_timer(timer).init();

    let meta_info = match parse_torrent(&args.file) {
        Ok(meta_info) => meta_info,
        Err(e) => {
            println!("Unable to parse file: {e}");
            return;
        },
    };
    let config = ClientConfig::default().with_port(args.port);

    let result = if args.inspect {
        println!("Contents of {}:\n{}", &args.file, meta_info);
        Ok(())
    } else if args.scrape {
        scrape(&meta_info, &config).await
    } else {
        connect(&meta_info, &config, args.peers, Duration::from_secs(args.seconds)).await
    };
    if let Err(e) = result {
        println!("{e}");
    }
}

async fn scrape(meta_info: &MetaInfo, config: &ClientConfig) -> torrentwire::Result<()> {
    let client = TrackerClient::new(config)?;
    let urls = meta_info.scraper_urls();
    if urls.is_empty() {
        println!("No tracker supports scraping");
    }
    for url in urls {
        match client.scrape(&url, &[meta_info.info_hash()]).await {
            Ok(response) => {
                for (hash, stats) in &response.files {
                    println!(
                        "{url}: {} complete={} incomplete={} downloaded={}",
                        hex::encode(hash),
                        stats.complete,
                        stats.incomplete,
                        stats.downloaded
                    );
                }
            },
            Err(e) => println!("{url}: {e}"),
        }
    }
    Ok(())
}

async fn connect(
    meta_info: &MetaInfo,
    config: &ClientConfig,
    max_peers: usize,
    duration: Duration,
) -> torrentwire::Result<()> {
    let response = discover_peers(meta_info, config).await?;
    print!("{response}");

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut attempts = JoinSet::new();
    for peer in response.peers.into_peers().into_iter().take(max_peers) {
        let config = config.clone();
        let events = events_tx.clone();
        let info_hash = meta_info.info_hash();
        attempts.spawn(async move { PeerConnection::connect(peer, info_hash, &config, events).await });
    }
    drop(events_tx);

    let mut connections = Vec::new();
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Ok(connection)) => {
                println!("Connected to {} ({})", connection.peer(), connection.remote_peer_id());
                if let Err(e) = connection.send(WireMessage::interested()).await {
                    warn!(peer = %connection.peer(), error = %e, "unable to send interested");
                }
                connections.push(connection);
            },
            Ok(Err(e)) => println!("Connection failed: {e}"),
            Err(e) => warn!(error = %e, "connect task panicked"),
        }
    }

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events_rx.recv() => match event {
                Some(PeerEvent::Message { peer, message }) => match message.kind() {
                    Some(kind) => println!("{peer}: {kind:?} ({} bytes)", message.length()),
                    None if message.is_keep_alive() => println!("{peer}: keep-alive"),
                    None => println!("{peer}: unknown message id {:?}", message.id()),
                },
                Some(PeerEvent::Closed { peer }) => println!("{peer}: closed"),
                Some(PeerEvent::Failed { peer, error }) => println!("{peer}: failed: {error}"),
                None => break,
            },
        }
    }

    info!(count = connections.len(), "stopping connections");
    for connection in connections {
        let peer = connection.peer().clone();
        if let Err(e) = connection.stop().await {
            info!(%peer, error = %e, "connection had already ended");
        }
    }
    Ok(())
}
