//! Feed subscriber: joins the multicast group, reassembles the session
//! in order, and reports progress until end of session or a stall.

use std::net::Ipv4Addr;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use moldcast::supervisor::{self, epoch_secs};
use moldcast::transport::UdpEndpoint;
use moldcast::{Client, SubscriberConfig};

#[derive(Parser, Debug)]
#[command(name = "subscriber", version, about = "moldcast feed subscriber")]
struct Args {
    /// Multicast IPv4 group to join
    #[arg(short = 'm', long, default_value = "239.192.168.1")]
    multicast: Ipv4Addr,

    /// IPv4 address of the interface to join on
    #[arg(short = 'i', long)]
    interface: Option<Ipv4Addr>,

    /// UDP port of the feed
    #[arg(short = 'p', long, default_value_t = 5858)]
    port: u16,

    /// Seconds without any packet before giving up, 0 = unlimited
    #[arg(short = 'w', long, default_value_t = 30)]
    wait: u64,

    /// Retransmit servers as host[:port], comma separated; learned from
    /// the feed when omitted
    #[arg(long = "req", value_delimiter = ',')]
    retransmit_servers: Vec<String>,

    /// First sequence expected
    #[arg(short = 'n', long, default_value_t = 1)]
    next_sequence: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let cfg = SubscriberConfig {
        group: args.multicast,
        port: args.port,
        interface: args.interface,
        retransmit_servers: args.retransmit_servers,
        next_sequence: args.next_sequence,
    };

    let mut client =
        Client::new(UdpEndpoint::new(), &cfg).context("opening the subscriber endpoint")?;
    let run = client.run_flag();
    let stats = client.stats();
    supervisor::on_termination(&run).context("installing the signal handler")?;

    let reader = {
        let run = run.clone();
        thread::spawn(move || -> anyhow::Result<u64> {
            let mut total = 0u64;
            let mut first = true;
            let result = loop {
                match client.read() {
                    Ok(Some(batch)) => {
                        total += batch.len() as u64;
                        if first {
                            info!("got first {} messages", batch.len());
                            first = false;
                        }
                    }
                    Ok(None) => break Ok(total),
                    Err(e) => {
                        error!("read failed: {}", e);
                        break Err(e.into());
                    }
                }
            };
            run.stop();
            client.report();
            result
        })
    };

    let mut next_report = epoch_secs() + 30;
    while run.is_running() {
        thread::sleep(Duration::from_secs(1));
        let now = epoch_secs();
        if args.wait > 0 && stats.last_recv_secs() + args.wait < now {
            error!("no packets for {} seconds", args.wait);
            run.stop();
        } else if now >= next_report {
            let s = stats.snapshot();
            info!(
                "recv: {} errors: {} requests: {} next seq: {}",
                s.received, s.errors, s.requests, s.next_seq
            );
            next_report = now + 30;
        }
    }

    let total = reader
        .join()
        .map_err(|_| anyhow::anyhow!("reader thread panicked"))??;
    let s = stats.snapshot();
    info!(
        "delivered {} messages, last block at {} ({} messages)",
        total, s.last_block_seq, s.last_block_len
    );
    info!("exit subscriber");
    Ok(())
}
