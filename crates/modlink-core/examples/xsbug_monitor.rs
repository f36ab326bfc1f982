//! xsbug Monitor
//!
//! Connects to a device, prints every debugger event and resumes execution
//! whenever the program stops.
//!
//! Usage:
//!   cargo run --example xsbug_monitor -- [OPTIONS] [URL]
//!
//! Options:
//!   --url URL         WebSocket URL (default: ws://localhost:8080)
//!   --usb             Use the USB bridge instead of WebSocket
//!   --baud RATE       USB baud rate (default: 921600)
//!   --config FILE     Load a JSON link configuration
//!   --break PATH:LINE Set a breakpoint after connecting (repeatable)
//!   --no-resume       Stay stopped at breaks

use anyhow::{bail, Context};
use modlink_core::prelude::*;
use modlink_core::protocol::{group_instruments, strip_path_prefix, Instrument, StackFrame};
use tracing_subscriber::EnvFilter;

const PATH_PREFIX: &str = "/mc";

struct Printer {
    instruments: Vec<Instrument>,
}

impl EventHandler for Printer {
    fn on_login(&mut self, name: &str, value: &str) {
        println!("login   {name} ({value})");
    }

    fn on_frames(&mut self, frames: &[StackFrame]) {
        for frame in frames {
            match &frame.location {
                Some(at) => println!(
                    "  at {} ({}:{})",
                    frame.name,
                    strip_path_prefix(&at.path, PATH_PREFIX),
                    at.line
                ),
                None => println!("  at {}", frame.name),
            }
        }
    }

    fn on_break(&mut self, path: &str, line: u32, message: &str) {
        println!(
            "break   {}:{} {}",
            strip_path_prefix(path, PATH_PREFIX),
            line,
            message
        );
    }

    fn on_log(&mut self, text: &str) {
        print!("{text}");
    }

    fn on_instruments(&mut self, instruments: &[Instrument]) {
        self.instruments = instruments.to_vec();
    }

    fn on_instrument_sample(&mut self, samples: &[i64]) {
        let line: Vec<String> = group_instruments(&self.instruments)
            .iter()
            .map(|group| {
                let values: Vec<String> = group
                    .indices
                    .iter()
                    .zip(&group.values)
                    .map(|(&i, unit)| match samples.get(i) {
                        Some(v) => format!("{v}{unit}"),
                        None => format!("?{unit}"),
                    })
                    .collect();
                format!("{}: {}", group.name, values.concat())
            })
            .collect();
        println!("sample  {}", line.join(", "));
    }

    fn on_protocol_error(&mut self, message: &str) {
        eprintln!("error   {message}");
    }

    fn on_disconnected(&mut self) {
        eprintln!("link lost");
    }
}

fn parse_breakpoint(arg: &str) -> anyhow::Result<Breakpoint> {
    let Some((path, line)) = arg.rsplit_once(':') else {
        bail!("breakpoint must be PATH:LINE, got {arg}");
    };
    let line = line
        .parse()
        .with_context(|| format!("invalid line in breakpoint {arg}"))?;
    Ok(Breakpoint::new(format!("{PATH_PREFIX}{path}"), line))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut url = "ws://localhost:8080".to_string();
    let mut usb = None::<UsbTarget>;
    let mut config_file = None;
    let mut breakpoints = Vec::new();
    let mut resume = true;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--url" => {
                i += 1;
                url = args.get(i).context("--url needs a value")?.clone();
            }
            "--usb" => {
                usb.get_or_insert_with(UsbTarget::default);
            }
            "--baud" => {
                i += 1;
                let baud = args
                    .get(i)
                    .context("--baud needs a value")?
                    .parse()
                    .context("invalid baud rate")?;
                usb.get_or_insert_with(UsbTarget::default).baud_rate = baud;
            }
            "--config" => {
                i += 1;
                config_file = Some(args.get(i).context("--config needs a value")?.clone());
            }
            "--break" => {
                i += 1;
                breakpoints.push(parse_breakpoint(
                    args.get(i).context("--break needs a value")?,
                )?);
            }
            "--no-resume" => resume = false,
            arg if !arg.starts_with('-') => url = arg.to_string(),
            other => bail!("unknown option: {other}"),
        }
        i += 1;
    }

    let config = match config_file {
        Some(path) => LinkConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {path}"))?,
        None => LinkConfig {
            target: match usb {
                Some(usb) => Target::Usb(usb),
                None => Target::Socket(SocketTarget::new(url)),
            },
            connection: ConnectionConfig::default(),
            install: InstallConfig::default(),
        },
    };

    let (mut link, mut events) = ConnectionManager::from_config(&config);
    link.connect()?
        .wait()
        .await
        .context("connecting to device")?;
    println!("connected");

    if !breakpoints.is_empty() {
        link.set_all_breakpoints(breakpoints, true, false)?;
    }

    let mut printer = Printer {
        instruments: Vec::new(),
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                event.dispatch(&mut printer);
                match event {
                    ConnectionEvent::Debug(DebugEvent::Break { .. }) if resume => {
                        if let Err(err) = link.go() {
                            eprintln!("could not resume: {err}");
                        }
                    }
                    ConnectionEvent::ConnectionError(message) => bail!(message),
                    _ => {}
                }
            }
        }
    }

    link.disconnect().await;
    Ok(())
}
