//! Feed publisher: loads a synthetic message log, multicasts it at the
//! configured pace, and serves retransmit requests until the session
//! ends.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::info;

use moldcast::constants::MAX_MESSAGE_SIZE;
use moldcast::supervisor;
use moldcast::transport::UdpEndpoint;
use moldcast::{Message, PublisherConfig, Server};

#[derive(Parser, Debug)]
#[command(name = "publisher", version, about = "moldcast feed publisher")]
struct Args {
    /// Multicast IPv4 group to stream to
    #[arg(short = 'm', long, default_value = "224.0.0.1")]
    multicast: Ipv4Addr,

    /// IPv4 address of the egress interface
    #[arg(short = 'i', long)]
    interface: Option<Ipv4Addr>,

    /// Deliver the stream to subscribers on this host too
    #[arg(short = 'l', long)]
    loopback: bool,

    /// UDP port of the feed
    #[arg(short = 'p', long, default_value_t = 5858)]
    port: u16,

    /// Pace in packets per millisecond
    #[arg(short = 's', long, default_value_t = 100)]
    ppms: usize,

    /// Synthetic messages to feed
    #[arg(short = 'c', long, default_value_t = 1_000_000)]
    count: usize,

    /// Bytes per synthetic message
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u16).range(1..=MAX_MESSAGE_SIZE as i64))]
    size: u16,

    /// Session tag; today's date when omitted
    #[arg(long)]
    session: Option<String>,

    /// Grace seconds between the end-of-session sentinel and exit
    #[arg(short = 'w', long, default_value_t = 5)]
    wait: u64,
}

/// Opaque numbered blobs standing in for application messages
fn synthetic_feed(count: usize, size: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            let mut data = vec![0u8; size];
            let stamp = (i as u64 + 1).to_be_bytes();
            let n = stamp.len().min(size);
            data[..n].copy_from_slice(&stamp[..n]);
            Message::new(data)
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let session = args
        .session
        .clone()
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d").to_string());
    let cfg = PublisherConfig {
        group: args.multicast,
        port: args.port,
        interface: args.interface,
        loopback: args.loopback,
        session,
        ppms: args.ppms,
        end_session_wait: args.wait,
    };

    let server =
        Arc::new(Server::new(UdpEndpoint::new(), &cfg).context("opening the publisher endpoint")?);
    supervisor::on_termination(&server.run_flag()).context("installing the signal handler")?;

    server
        .feed(synthetic_feed(args.count, args.size as usize))
        .context("feeding the message log")?;
    info!(
        "feeding {} messages of {} bytes, session {:?}",
        args.count, args.size, cfg.session
    );

    let start = Instant::now();
    let requests = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.request_loop())
    };
    let sender = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.send_loop())
    };

    let run = server.run_flag();
    let mut next_report = Instant::now() + Duration::from_secs(30);
    while run.is_running() {
        thread::sleep(Duration::from_secs(1));
        if server.drained() {
            server.end_session(args.wait);
        } else if Instant::now() >= next_report {
            server.report();
            next_report = Instant::now() + Duration::from_secs(30);
        }
    }

    sender.join().ok();
    requests.join().ok();
    server.report();
    info!("exit publisher, ran {:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}
