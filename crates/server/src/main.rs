//! RemoteHub server executable
//!
//! Thin embedder around the server library: loads the JSON configuration,
//! subscribes table-rendering callbacks and waits for ctrl-c.

use clap::Parser;
use server::{DeviceState, Server, ServerConfig, UsbDeviceInfo};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

static LAST_CHANGE: Mutex<String> = Mutex::new(String::new());

#[derive(Parser, Debug)]
#[command(name = "rh-server")]
#[command(author, version, about = "RemoteHub server - share local USB devices over the network")]
struct Args {
    /// Path to server configuration file
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

fn device_state_changed(state: DeviceState, dev: &protocol::UsbDevice) {
    let label = match state {
        DeviceState::Attached => "ATTACHED",
        DeviceState::Detached => "DETACHED",
        DeviceState::Exported => "EXPORTED",
        DeviceState::Unexported => "UNEXPORTED",
    };
    *LAST_CHANGE.lock().unwrap() = format!(
        "{} [{:#06x}:{:#06x}] {}",
        dev.busid, dev.id_vendor, dev.id_product, label
    );
}

fn print_devicelist(devlist: &[UsbDeviceInfo]) {
    print!("\x1b[1;1H\x1b[2J");
    println!(
        "|{:^21}|{:^22}|{:^22}|{:^10}|",
        "Busid", "Manufacturer", "Product", "Exported"
    );
    for info in devlist {
        println!(
            "|{:<21.21}|{:<22.22}|{:<22.22}|{:<10.10}|",
            info.udev.busid,
            info.manufacturer,
            info.product,
            if info.exported { "True" } else { "False" }
        );
    }

    let mut last = LAST_CHANGE.lock().unwrap();
    if !last.is_empty() {
        println!("{}", last);
        last.clear();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    common::setup_logging(&args.log_level)?;

    let config = match ServerConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Server init failed [{}]", e);
            std::process::exit(1);
        }
    };

    let server = match Server::start(config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Server init failed [{}]", e);
            std::process::exit(1);
        }
    };

    server.subscribe_devicelist(Arc::new(print_devicelist));
    server.subscribe_attached(Arc::new(device_state_changed));
    server.subscribe_detached(Arc::new(device_state_changed));
    server.subscribe_exported(Arc::new(device_state_changed));
    server.subscribe_unexported(Arc::new(device_state_changed));

    tokio::signal::ctrl_c().await?;

    server.shutdown().await;
    Ok(())
}
