//! RemoteHub client executable
//!
//! Attempts to attach every USB device offered by discovered servers (or by
//! one targeted server given with --ip). Devices on the local block list
//! are skipped.

use clap::Parser;
use client::{Client, ClientConfig};
use protocol::UsbDevice;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Devices never auto-attached, by VID/PID
const BLOCKED_DEVICES: &[(u16, u16)] = &[
    (0x0424, 0xec00),
    (0x21b4, 0x0083),
    (0x413c, 0x3012),
];

#[derive(Parser, Debug)]
#[command(name = "rh-client")]
#[command(
    author,
    version,
    about = "RemoteHub client - attach remote USB devices via vhci_hcd"
)]
struct Args {
    /// Path to client configuration file
    #[arg(short = 'c', long, value_name = "PATH")]
    config: PathBuf,

    /// Use only the server at this address instead of discovery
    #[arg(short = 'i', long, value_name = "ADDR")]
    ip: Option<String>,

    /// Port to use with the targeted address
    #[arg(short = 'p', long, value_name = "PORT", default_value_t = 3240)]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

enum Request {
    Devicelist(String, u16),
    Attach(String, u16, UsbDevice),
}

fn device_blocked(dev: &UsbDevice) -> bool {
    BLOCKED_DEVICES
        .iter()
        .any(|&(vid, pid)| dev.id_vendor == vid && dev.id_product == pid)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    common::setup_logging(&args.log_level)?;

    let config = match ClientConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Client init failed [{}]", e);
            std::process::exit(1);
        }
    };

    let client = match Client::start(config).await {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Client init failed [{}]", e);
            std::process::exit(1);
        }
    };

    // Callbacks run on the interface worker; forward their requests to
    // this task, which owns the client handle
    let (req_tx, mut req_rx) = tokio::sync::mpsc::unbounded_channel::<Request>();

    let tx = req_tx.clone();
    client.subscribe_devicelist(Arc::new(move |success, server, port, devlist| {
        if !success {
            eprintln!("Failed to get devicelist from {}:{}", server, port);
            return;
        }
        for dev in devlist {
            if !device_blocked(dev) {
                let _ = tx.send(Request::Attach(server.to_string(), port, dev.clone()));
            }
        }
    }));

    client.subscribe_attach(Arc::new(|success, server, port, dev| {
        if success {
            println!("Attached {} from {}:{}", dev.path, server, port);
        }
    }));

    client.subscribe_detach(Arc::new(|success, server, port, dev| {
        if success {
            println!("Detached {} from {}:{}", dev.path, server, port);
        }
    }));

    if args.ip.is_none() {
        let tx = req_tx.clone();
        client.subscribe_discovery(Arc::new(move |server| {
            let _ = tx.send(Request::Devicelist(server.ip.clone(), server.port));
        }));
    }

    println!("Client started");

    let mut poll = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                if let Some(ip) = &args.ip {
                    client.get_devicelist(ip, args.port).await;
                }
            }
            Some(request) = req_rx.recv() => match request {
                Request::Devicelist(ip, port) => client.get_devicelist(&ip, port).await,
                Request::Attach(ip, port, dev) => client.attach_device(&ip, port, dev).await,
            }
        }
    }

    println!("Stopping client");
    client.shutdown().await;
    Ok(())
}
