//! NDS stream utility: inspect, splice, convert, and repair stream files.
//!
//! Operands use the `key=value` convention:
//!
//! ```text
//! ndstool info   if=FILE
//! ndstool split  if=FILE of=OUT [start=N] [count=M]
//! ndstool repair if=FILE [of=RECOVERED.nds]
//! ```
//!
//! `split` copies a contiguous range of scans. When the output file ends in
//! `.bin`, `.txt`, or `.dat` the scans are converted (raw binary or ASCII
//! text, one scan per row) instead of re-encoded as a stream; the conversion
//! buffers through a temp spooler so memory stays bounded.
//!
//! Exit codes: 0 on success, 22 (EINVAL) for missing or invalid arguments,
//! 5 (EIO) for read or decode failures.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use clap::{Parser, Subcommand};

use daqpipe::dsd::{repair, DsdReader, DsdWriter};
use daqpipe::sample::Sample;
use daqpipe::spool::TempSpooler;

const EXIT_EINVAL: i32 = 22;
const EXIT_EIO: i32 = 5;

#[derive(Parser)]
#[command(
    name = "ndstool",
    about = "NDS stream file utility",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    op: Op,
}

#[derive(Subcommand)]
enum Op {
    /// Print usage information.
    Help,
    /// Show information about a stream file (if=FILE).
    Info {
        /// key=value operands
        args: Vec<String>,
    },
    /// Copy a contiguous scan range (if=FILE of=OUT [start=N] [count=M]).
    Split {
        /// key=value operands
        args: Vec<String>,
    },
    /// Rebuild a stream whose footer is missing (if=FILE [of=RECOVERED.nds]).
    Repair {
        /// key=value operands
        args: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return EXIT_EINVAL;
        }
    };

    match cli.op {
        Op::Help => {
            print_usage();
            EXIT_EINVAL
        }
        Op::Info { args } => with_operands(&args, do_info),
        Op::Split { args } => with_operands(&args, do_split),
        Op::Repair { args } => with_operands(&args, do_repair),
    }
}

fn with_operands(args: &[String], op: fn(&BTreeMap<String, String>) -> i32) -> i32 {
    match parse_operands(args) {
        Ok(kv) => op(&kv),
        Err(msg) => {
            eprintln!("{}", msg);
            EXIT_EINVAL
        }
    }
}

fn parse_operands(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut kv = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("invalid operand '{}': expected key=value", arg))?;
        if key.trim().is_empty() || value.trim().is_empty() {
            return Err(format!("invalid operand '{}': empty key or value", arg));
        }
        kv.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(kv)
}

fn print_usage() {
    eprintln!(
        "ndstool - NDS stream file utility\n\n\
         Synopsis:\n\n    ndstool operation [arg=value ...]\n\n\
         Operations:\n\n\
         info\n    Show size, index range, scan count, rate, and duration.\n\
             if=FILE   input stream (required)\n\n\
         split\n    Copy a contiguous scan range to another file. An output\n\
             ending in .bin is raw binary; .txt or .dat is ASCII text;\n\
             anything else is a stream file.\n\
             if=FILE   input stream (required)\n\
             of=FILE   output file (required)\n\
             start=N   relative scan to start from (default 0)\n\
             count=M   number of scans to copy (default: all)\n\n\
         repair\n    Re-read a damaged stream defensively and write a\n\
             well-formed copy.\n\
             if=FILE   file to recover (required)\n\
             of=FILE   recovered output (default RECOVERED.nds)"
    );
}

fn do_info(kv: &BTreeMap<String, String>) -> i32 {
    let Some(path) = kv.get("if") else {
        eprintln!("a required argument to 'info' is missing: if=FILE");
        return EXIT_EINVAL;
    };
    if !Path::new(path).exists() {
        eprintln!("no such file: {}", path);
        return EXIT_EINVAL;
    }

    let (size, reader) = match open_stream(path) {
        Ok(ok) => ok,
        Err(msg) => {
            eprintln!("{}", msg);
            return EXIT_EIO;
        }
    };

    let start = reader.start_index();
    let end = reader.end_index();
    let has_holes = reader.scan_count() < end.saturating_sub(start) + 1;
    println!("Information for file '{}':", path);
    println!("File size:               {} bytes", size);
    println!("Starting scan index:     {}", start);
    println!("Ending scan index:       {}", end);
    println!(
        "Number of scans:         {}{}",
        reader.scan_count(),
        if has_holes {
            " (file has holes/dropped scans)"
        } else {
            ""
        }
    );
    println!("Sampling rate:           {} Hz", reader.rate_at(start));
    println!("Time-length:             {} seconds", reader.time_at(end));
    0
}

fn do_split(kv: &BTreeMap<String, String>) -> i32 {
    let (Some(input), Some(output)) = (kv.get("if"), kv.get("of")) else {
        eprintln!("a required argument to 'split' is missing: if=FILE of=OUT");
        return EXIT_EINVAL;
    };
    if !Path::new(input).exists() {
        eprintln!("no such file: {}", input);
        return EXIT_EINVAL;
    }
    let start = match parse_count(kv.get("start"), 0) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            return EXIT_EINVAL;
        }
    };
    let count = match parse_count(kv.get("count"), u64::MAX) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            return EXIT_EINVAL;
        }
    };

    eprintln!("Reading {}", input);
    match split_stream(input, output, start, count) {
        Ok(copied) => {
            eprintln!("Copied {} scans to {}", copied, output);
            0
        }
        Err(e) => {
            eprintln!("split failed: {}", e);
            EXIT_EIO
        }
    }
}

fn do_repair(kv: &BTreeMap<String, String>) -> i32 {
    let Some(input) = kv.get("if") else {
        eprintln!("a required argument to 'repair' is missing: if=FILE");
        return EXIT_EINVAL;
    };
    if !Path::new(input).exists() {
        eprintln!("no such file: {}", input);
        return EXIT_EINVAL;
    }
    let default_out = "RECOVERED.nds".to_owned();
    let output = kv.get("of").unwrap_or(&default_out);

    let result = (|| -> anyhow::Result<u64> {
        let inp = BufReader::new(File::open(input)?);
        let out = BufWriter::new(File::create(output)?);
        let (stats, sink) = repair(inp, out)?;
        sink.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(stats.samples_recovered)
    })();

    match result {
        Ok(samples) => {
            println!("Recovered {} samples.", samples);
            0
        }
        Err(e) => {
            eprintln!("repair failed: {}", e);
            EXIT_EIO
        }
    }
}

fn parse_count(value: Option<&String>, default: u64) -> Result<u64, String> {
    match value {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|_| format!("invalid numeric argument '{}'", v)),
    }
}

fn open_stream(path: &str) -> Result<(u64, DsdReader<BufReader<File>>), String> {
    let file = File::open(path).map_err(|e| format!("cannot open {}: {}", path, e))?;
    let size = file
        .metadata()
        .map_err(|e| format!("cannot stat {}: {}", path, e))?
        .len();
    let reader = DsdReader::open(BufReader::new(file)).map_err(|e| format!("{}", e))?;
    Ok((size, reader))
}

/// Where a split lands, by output extension.
enum OutKind {
    Nds,
    Bin,
    Ascii,
}

fn out_kind(path: &str) -> OutKind {
    if path.ends_with(".bin") {
        OutKind::Bin
    } else if path.ends_with(".txt") || path.ends_with(".dat") {
        OutKind::Ascii
    } else {
        OutKind::Nds
    }
}

fn split_stream(input: &str, output: &str, start: u64, count: u64) -> anyhow::Result<u64> {
    let (_size, mut reader) = open_stream(input).map_err(anyhow::Error::msg)?;

    // `start` is a relative scan position within the file
    let mut skipped = 0u64;
    while skipped < start {
        if reader.read_next_scan()?.is_none() {
            return Ok(0);
        }
        skipped += 1;
    }

    // before the first scan is read the live rate is unknown; fall back to
    // the footer's rate at the start of the stream
    let rate = if reader.sampling_rate() > 0 {
        reader.sampling_rate()
    } else {
        reader.rate_at(reader.start_index()).max(1)
    };
    match out_kind(output) {
        OutKind::Nds => split_to_stream(&mut reader, output, count),
        OutKind::Bin => convert(&mut reader, output, count, rate, false),
        OutKind::Ascii => convert(&mut reader, output, count, rate, true),
    }
}

fn split_to_stream(
    reader: &mut DsdReader<BufReader<File>>,
    output: &str,
    count: u64,
) -> anyhow::Result<u64> {
    let sink = BufWriter::new(File::create(output)?);
    let rate = if reader.sampling_rate() > 0 {
        reader.sampling_rate()
    } else {
        reader.rate_at(reader.start_index()).max(1)
    };
    let mut writer = DsdWriter::new(sink, rate, reader.data_type());

    let mut copied = 0u64;
    while copied < count {
        let Some(scan) = reader.read_next_scan()? else {
            break;
        };
        for chan in writer.channels_on() {
            if !scan.contains_key(&chan) {
                writer.remove_channel_after(chan, writer.scan_index());
            }
        }
        for sample in scan.values() {
            writer.write_sample(sample)?;
        }
        let rate = reader.sampling_rate();
        if rate > 0 && rate != writer.sampling_rate() {
            writer.set_sampling_rate(rate);
        }
        for (name, data) in reader.user_data_map() {
            writer.write_user_data(name, data);
        }
        copied += 1;
    }
    writer
        .end()?
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok(copied)
}

/// Convert scans to raw binary or ASCII text, buffering through a spooler so
/// arbitrarily long splices use bounded memory.
fn convert(
    reader: &mut DsdReader<BufReader<File>>,
    output: &str,
    count: u64,
    rate: u32,
    ascii: bool,
) -> anyhow::Result<u64> {
    let mut spool: TempSpooler<Sample> = TempSpooler::new("ndstool", true)?;
    let mut channels: BTreeSet<u32> = BTreeSet::new();

    let mut copied = 0u64;
    while copied < count {
        let Some(scan) = reader.read_next_scan()? else {
            break;
        };
        let samples: Vec<Sample> = scan.values().copied().collect();
        channels.extend(scan.keys().copied());
        spool.spool(&samples)?;
        copied += 1;
    }

    let mut out = BufWriter::new(File::create(output)?);
    if !ascii {
        out.write_i32::<LittleEndian>(channels.len() as i32)?;
    }

    // last value per channel persists across scans the channel is absent from
    let mut values: BTreeMap<u32, f32> = channels.iter().map(|c| (*c, 0.0)).collect();
    let mut current: Option<u64> = None;
    let mut io_err: Option<std::io::Error> = None;

    spool.for_each(|s| {
        if io_err.is_some() {
            return;
        }
        match current {
            Some(index) if s.scan_index != index => {
                if let Err(e) = emit_scan(&mut out, ascii, rate, index, &values) {
                    io_err = Some(e);
                }
                current = Some(s.scan_index);
            }
            Some(_) => {}
            None => current = Some(s.scan_index),
        }
        values.insert(u32::from(s.channel_id), s.data as f32);
    })?;
    if let (Some(index), None) = (current, &io_err) {
        if let Err(e) = emit_scan(&mut out, ascii, rate, index, &values) {
            io_err = Some(e);
        }
    }

    if let Some(e) = io_err {
        return Err(e.into());
    }
    out.flush()?;
    Ok(copied)
}

fn emit_scan(
    out: &mut BufWriter<File>,
    ascii: bool,
    rate: u32,
    index: u64,
    values: &BTreeMap<u32, f32>,
) -> std::io::Result<()> {
    let time = index as f64 / f64::from(rate);
    if ascii {
        write!(out, "{}", time)?;
        for v in values.values() {
            write!(out, " {}", v)?;
        }
        writeln!(out)?;
    } else {
        out.write_f32::<LittleEndian>(time as f32)?;
        for v in values.values() {
            out.write_f32::<LittleEndian>(*v)?;
        }
    }
    Ok(())
}
