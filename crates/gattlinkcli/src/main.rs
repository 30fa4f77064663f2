//! Receive one GATT notification from a peripheral
//!
//! Connects to the given device on the ATT channel, waits for the peer to
//! push a notification or indication, prints it, and exits. The wait is
//! bounded: an unattended run terminates instead of hanging forever.

use std::io::Write;
use std::process;
use std::time::Duration;

use log::debug;

use gattlink::{AddressType, BdAddr, GattClient, SessionConfig};

/// How long to wait for the peer to push a value.
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(300);

fn usage(program: &str) -> ! {
    eprintln!("Usage: {program} <device-address> [public|random]");
    process::exit(1);
}

fn main() {
    env_logger::init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "gattlinkcli".into());

    let addr: BdAddr = match args.next() {
        Some(arg) => match arg.parse() {
            Ok(addr) => addr,
            Err(err) => {
                eprintln!("{err}");
                process::exit(1);
            }
        },
        None => usage(&program),
    };

    // The original peripheral-side tooling this replaces spoke to devices
    // with public addresses; random is available for peripherals that
    // advertise with one.
    let addr_type = match args.next().as_deref() {
        None | Some("public") => AddressType::Public,
        Some("random") => AddressType::Random,
        Some(_) => usage(&program),
    };

    print!("Connecting... ");
    let _ = std::io::stdout().flush();

    let client = match GattClient::connect(&addr, addr_type, SessionConfig::default()) {
        Ok(client) => client,
        Err(err) => {
            println!();
            eprintln!("error: {err}");
            process::exit(1);
        }
    };
    println!("OK!");
    debug!("connected to {addr} ({addr_type:?})");

    println!(
        "\nThis is a bit tricky. You need to make your device send\n\
         a notification. Waiting (up to {}s)...",
        NOTIFICATION_TIMEOUT.as_secs()
    );

    match client.wait_for_first_notification(NOTIFICATION_TIMEOUT) {
        Ok(event) => {
            println!(
                "- notification on handle {:#06x}: {}",
                event.handle,
                hex::encode(&event.value)
            );
        }
        Err(err) => {
            eprintln!("error: {err}");
            let _ = client.disconnect();
            process::exit(1);
        }
    }

    let _ = client.disconnect();
    println!("Done.");
}
