//! Relay example: read one path and print what arrives
//!
//! Run with: cargo run --example relay CONFIG.yml PATH
//!
//! Example config:
//!
//! ```yaml
//! readTimeout: 10s
//! paths:
//!   cam1:
//!     source: http://camera.local/stream.m3u8
//!     sourceOnDemand: yes
//! ```
//!
//! Then:
//!   cargo run --example relay relay.yml cam1

use std::time::Duration;

use relay_rs::{PathManager, Protocol, RelayConfig};

fn print_usage() {
    println!("Usage: relay CONFIG.yml PATH");
    println!();
    println!("Attaches a reader to PATH and prints packet statistics every second.");
    println!("Set RUST_LOG to change verbosity (default: relay_rs=info).");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() != 3 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_rs=info".parse()?)
                .add_directive("relay=info".parse()?),
        )
        .init();

    let config = RelayConfig::from_file(&args[1])?;
    let path_name = args[2].clone();
    let manager = PathManager::new(config)?;

    println!("Reading {} (Ctrl+C to stop)", path_name);

    let reader_manager = manager.clone();
    let reader_task = tokio::spawn(async move {
        let mut reader = match reader_manager.read(&path_name, Protocol::Rtsp).await {
            Ok(reader) => reader,
            Err(e) => {
                eprintln!("Cannot read {}: {}", path_name, e);
                return;
            }
        };

        if let Some(track) = reader.track() {
            println!("a=rtpmap:{}", track.rtpmap());
            println!("a=fmtp:{}", track.fmtp());
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let (mut packets, mut bytes, mut keyframes) = (0u64, 0u64, 0u64);
        loop {
            tokio::select! {
                frame = reader.recv() => match frame {
                    Some(frame) => {
                        packets += 1;
                        bytes += frame.data.len() as u64;
                        if frame.is_keyframe() {
                            keyframes += 1;
                        }
                    }
                    None => {
                        println!("Path closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    println!(
                        "packets={} bytes={} keyframe_packets={} overruns={}",
                        packets,
                        bytes,
                        keyframes,
                        reader.overruns()
                    );
                }
            }
        }
    });

    tokio::select! {
        _ = reader_task => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    manager.close().await;
    Ok(())
}
