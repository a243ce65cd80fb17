//! Headless acquisition pipeline: emulated producer, reader loop, listeners.
//!
//! Wires the whole data plane together: creates the control block and the
//! sample FIFO, configures channels/rate/spike detection from the command
//! line, starts the emulated producer thread, and drives the reader loop with
//! a trace window, a spike logger, and (optionally) an NDS stream writer
//! attached. Ctrl-C (or `--duration`) stops the producer; the loop drains the
//! FIFO and exits cleanly on end-of-stream.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use daqpipe::control::{ControlBlock, SpikePolarity, SubdevKind};
use daqpipe::dsd::{DataType, DsdWriter};
use daqpipe::fifo::sample_fifo;
use daqpipe::listener::{listener_ref, DsdWriterListener, SpikeLogger, TraceWindow};
use daqpipe::producer::EmulatedProducer;
use daqpipe::reader::SampleReader;
use daqpipe::reader_loop::ReaderLoop;
use daqpipe::source::FifoSource;

#[derive(Parser, Debug)]
#[command(name = "daqpipe", about = "Multi-channel acquisition pipeline (emulated producer)")]
struct Args {
    /// Channels to acquire.
    #[arg(long, value_delimiter = ',', default_value = "0,1")]
    channels: Vec<u32>,

    /// Sampling rate in Hz.
    #[arg(long, default_value_t = 1000)]
    rate: u32,

    /// Record the run to this NDS stream file.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Write 64-bit scalars instead of 32-bit in the output stream.
    #[arg(long, default_value_t = false)]
    double: bool,

    /// Stop after this many seconds (default: run until Ctrl-C).
    #[arg(long)]
    duration: Option<f64>,

    /// Backing file for the shared control block.
    #[arg(long)]
    control_file: Option<PathBuf>,

    /// Enable spike detection on every channel at this threshold.
    #[arg(long)]
    spike_threshold: Option<f64>,

    /// Spike blanking window in milliseconds.
    #[arg(long, default_value_t = 100)]
    spike_blanking: u32,

    /// Detect spikes below the threshold instead of above it.
    #[arg(long, default_value_t = false)]
    spike_negative: bool,

    /// Seconds of samples the live trace window keeps per channel.
    #[arg(long, default_value_t = 10)]
    window_secs: u32,

    /// FIFO capacity in records.
    #[arg(long, default_value_t = 16384)]
    fifo_records: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let control_path = args
        .control_file
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("daqpipe-control.shm"));
    let control = Arc::new(
        ControlBlock::create(&control_path, 64, 0)
            .with_context(|| format!("creating control block at {}", control_path.display()))?,
    );

    control.set_sampling_rate_hz(args.rate);
    for chan in &args.channels {
        control.set_channel_enabled(SubdevKind::AnalogInput, *chan, true);
        if let Some(threshold) = args.spike_threshold {
            control.set_spike_enabled(*chan, true);
            control.set_spike_threshold(*chan, threshold);
            control.set_spike_blanking(*chan, args.spike_blanking);
            control.set_spike_polarity(
                *chan,
                if args.spike_negative {
                    SpikePolarity::Negative
                } else {
                    SpikePolarity::Positive
                },
            );
        }
    }

    let (fifo_writer, fifo_reader) = sample_fifo(args.fifo_records);
    let (producer_thread, producer_stop) =
        EmulatedProducer::new(Arc::clone(&control), fifo_writer).spawn()?;

    let reader = SampleReader::new(
        Box::new(FifoSource::new(fifo_reader)),
        Some(Duration::from_millis(100)),
    );
    let mut reader_loop = ReaderLoop::new(reader);

    let window = listener_ref(TraceWindow::new(
        "live",
        args.channels.clone(),
        args.window_secs,
        args.rate,
    ));
    reader_loop.add_listener(window.clone());

    let spikes = listener_ref(SpikeLogger::new(args.channels.clone()));
    reader_loop.add_listener(spikes.clone());

    let stream = match &args.output {
        Some(path) => {
            let sink = BufWriter::new(
                File::create(path)
                    .with_context(|| format!("creating output stream {}", path.display()))?,
            );
            let data_type = if args.double {
                DataType::Double
            } else {
                DataType::Float
            };
            let listener = listener_ref(DsdWriterListener::new(
                DsdWriter::new(sink, args.rate, data_type),
                args.channels.clone(),
            ));
            reader_loop.add_listener(listener.clone());
            Some(listener)
        }
        None => None,
    };

    // Stopping the producer closes the FIFO; the loop then drains it and
    // stops on end-of-stream, losing nothing already delivered.
    {
        let producer_stop = producer_stop.clone();
        ctrlc::set_handler(move || {
            eprintln!("stopping...");
            producer_stop.stop();
        })
        .context("installing Ctrl-C handler")?;
    }
    if let Some(seconds) = args.duration {
        let producer_stop = producer_stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            producer_stop.stop();
        });
    }

    info!(
        channels = ?args.channels,
        rate = args.rate,
        output = ?args.output,
        "acquisition running"
    );
    reader_loop.run()?;
    producer_thread
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;

    if let Some(stream) = stream {
        let mut guard = stream
            .lock()
            .map_err(|_| anyhow::anyhow!("stream listener poisoned"))?;
        let written = guard.sample_count();
        guard.finish()?;
        info!(samples = written, "stream closed");
    }
    let spikes_total = spikes
        .lock()
        .map_err(|_| anyhow::anyhow!("spike logger poisoned"))?
        .total();
    info!(
        read = reader_loop.num_read(),
        dropped = reader_loop.num_dropped(),
        spikes = spikes_total,
        "acquisition finished"
    );
    Ok(())
}
