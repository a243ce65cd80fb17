//! The emulated producer domain.
//!
//! A real deployment drives the pipeline from a real-time sampling task; this
//! module provides the in-process stand-in. It owns the FIFO's write side,
//! re-reads the consumer-owned control fields (mask, rate, spike parameters)
//! every scan, synthesizes a per-channel waveform, runs the spike detector,
//! and pushes whole records without ever blocking — when the consumer falls
//! behind, records are dropped and counted, exactly the contract the reader's
//! drop accounting expects.
//!
//! The synthetic signal is a per-channel sine (so traces are recognizably
//! different) plus uniform noise, centered on a 12-bit converter's midpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::info;

use crate::control::{ControlBlock, SubdevKind};
use crate::fifo::FifoWriter;
use crate::reader_loop::StopHandle;
use crate::sample::Sample;
use crate::spike::SpikeDetector;

/// Converter midpoint for the synthetic signal (12-bit style).
const MID_SCALE: f64 = 2048.0;

/// Sine amplitude of the synthetic signal.
const AMPLITUDE: f64 = 1000.0;

/// Peak uniform noise added to each reading.
const NOISE_COUNTS: u32 = 32;

/// In-process producer thread feeding the sample FIFO.
pub struct EmulatedProducer {
    control: Arc<ControlBlock>,
    fifo: FifoWriter,
    detector: SpikeDetector,
    stop: Arc<AtomicBool>,
}

impl EmulatedProducer {
    /// Build a producer over an existing control block and FIFO write side.
    pub fn new(control: Arc<ControlBlock>, fifo: FifoWriter) -> Self {
        EmulatedProducer {
            control,
            fifo,
            detector: SpikeDetector::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the producer thread. Returns the join handle and a stop handle.
    pub fn spawn(self) -> crate::error::DaqResult<(thread::JoinHandle<()>, StopHandle)> {
        let stop = StopHandle::from_flag(Arc::clone(&self.stop));
        let handle = thread::Builder::new()
            .name("emulated-producer".to_owned())
            .spawn(move || self.run())?;
        Ok((handle, stop))
    }

    fn run(mut self) {
        let mut rng = rand::thread_rng();
        let mut next_tick = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            let rate = self.control.sampling_rate_hz().max(1);
            let mask = self.control.channels_in_use(SubdevKind::AnalogInput);
            let scan_index = self.control.scan_index();

            for chan in mask.channels_on() {
                let data = synth_reading(chan, scan_index, rate, &mut rng);
                let range = self.control.channel_range(SubdevKind::AnalogInput, chan);
                let sample = Sample::new(chan as u8, scan_index, range, data);
                let params = self.control.spike_params(chan);
                let sample = self.detector.apply(&params, sample, rate);
                self.fifo.push(&sample);
            }
            self.control.advance_scan_index();

            next_tick += Duration::from_secs_f64(1.0 / f64::from(rate));
            let now = Instant::now();
            if next_tick > now {
                thread::sleep(next_tick - now);
            } else {
                // fell behind; resynchronize instead of bursting
                next_tick = now;
            }
        }

        info!(
            scans = self.control.scan_index(),
            dropped = self.fifo.dropped(),
            "producer stopped"
        );
    }
}

fn synth_reading(chan: u32, scan_index: u64, rate: u32, rng: &mut impl Rng) -> u32 {
    let hz = 5.0 + f64::from(chan);
    let t = scan_index as f64 / f64::from(rate);
    let wave = MID_SCALE + AMPLITUDE * (2.0 * std::f64::consts::PI * hz * t).sin();
    wave as u32 + rng.gen_range(0..NOISE_COUNTS)
}
