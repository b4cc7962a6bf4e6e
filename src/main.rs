#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};

use stm32_uart_flasher::progress::Event;
use stm32_uart_flasher::{task, Options, Programmer};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Firmware image to program
    #[structopt(parse(from_os_str))]
    file: PathBuf,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let size = std::fs::metadata(&o.file)
        .with_context(|| format!("reading image {}", o.file.display()))?
        .len();
    info!("Image: {} ({})", o.file.display(), bytefmt::format(size));

    info!("Connecting to serial port");

    let port = o.port.clone();
    let p = Programmer::linux(&o.port, o.baud, o.options)
        .with_context(|| format!("connecting to serial port {}", port))?;

    let (tx, rx) = mpsc::channel::<Event<std::io::ErrorKind>>();
    let handle = task::spawn(p, o.file.clone(), tx);

    let bar = ProgressBar::new(100);
    bar.set_style(ProgressStyle::default_bar().template("{msg:>12} [{bar:40}] {pos:>3}%"));

    // The sender is dropped with the session, ending this loop
    for event in rx {
        match event {
            Event::Started => bar.set_message("starting"),
            Event::State(s) => debug!("State: {:?}", s),
            Event::Progress(v) => bar.set_position(v as u64),
            Event::Finished(Ok(())) => bar.finish_with_message("done"),
            Event::Finished(Err(e)) => {
                bar.abandon_with_message("failed");
                if !e.diagnostics().is_empty() {
                    error!("Diagnostic buffer: {}", hex::encode(e.diagnostics()));
                }
            }
        }
    }

    let (_p, outcome) = handle
        .join()
        .map_err(|_| anyhow!("programming thread panicked"))?;

    outcome.context("programming failed")?;

    info!("Programming complete");

    Ok(())
}
