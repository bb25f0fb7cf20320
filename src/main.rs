mod bytecode;
mod classfile;
mod cli;
mod codelet;
mod error;
mod event;
mod jit;
mod output;
mod pt;
mod runtime;
mod sideband;
mod trace;

use std::fs;

use clap::Parser;
use rayon::prelude::*;

use classfile::ClassPath;
use cli::Opt;
use error::AppError;
use event::segment_by_thread;
use output::ThreadSummary;
use pt::Driver;
use runtime::dump::DumpReader;
use runtime::{MethodTable, Timeline};
use sideband::{SidebandReplayer, TimeConversion};
use trace::TraceFile;

fn main() {
    let opt = Opt::parse();
    init_logger(opt.verbose);
    if opt.jobs > 0 {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(opt.jobs).build_global() {
            log::warn!("failed to size the thread pool to {} job(s): {e}", opt.jobs);
        }
    }
    if let Err(e) = run(opt) {
        log::error!("{e}");
        eprintln!("jportal-decode: {e}");
        std::process::exit(1);
    }
}

/// `-v`/`-vv`/`-vvv` raise the default filter; `RUST_LOG` still wins when set,
/// matching the convention the teacher's own CLIs use for verbosity.
fn init_logger(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn run(opt: Opt) -> Result<(), AppError> {
    let file = fs::File::open(&opt.trace_data)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let data: &[u8] = &mmap;
    let trace = TraceFile::parse(data)?;
    let work_items = trace.split_pt(data, opt.split_number)?;
    let jvm_runtime = trace.jvm_runtime_data(data);

    log::info!("{} work item(s) across {} CPU(s)", work_items.len(), trace.cpus().len());

    let conversion = TimeConversion {
        time_mult: trace.header.time_mult,
        time_shift: trace.header.time_shift,
        time_zero: trace.header.time_zero,
    };

    let per_item: Vec<(MethodTable, Vec<event::ThreadSegment>)> = work_items
        .par_iter()
        .map(|item| {
            let mut timeline = Timeline::new();
            let mut dump = DumpReader::new(&jvm_runtime);
            let sideband_data = trace.sideband_data(data, item.cpu);
            let sideband = SidebandReplayer::new(&sideband_data, trace.header.sample_type, conversion);
            let mut driver = Driver::new(&item.pt_data, &mut timeline, dump_reset(&mut dump), sideband);
            driver.run();
            let events = driver.into_events();
            let segments = segment_by_thread(events);
            (timeline.methods, segments)
        })
        .collect();

    let mut methods = MethodTable::new();
    let mut segments = Vec::new();
    for (item_methods, item_segments) in per_item {
        methods.merge_from(&item_methods);
        segments.extend(item_segments);
    }

    let mut classes = ClassPath::new(opt.class_path.clone());
    let summaries = output::write_outputs(segments, &mut methods, &mut classes, &opt.out_prefix)?;
    report(&summaries);
    Ok(())
}

/// `DumpReader` borrows the dump bytes, not the passed-in reader, so this
/// is just a move that keeps the call site above readable as "one reader
/// per work item" without a second binding.
fn dump_reset(reader: &mut DumpReader<'_>) -> DumpReader<'_> {
    std::mem::replace(reader, DumpReader::new(&[]))
}

fn report(summaries: &[ThreadSummary]) {
    let mut lossy = 0;
    let mut decode_errors = 0u64;
    for s in summaries {
        decode_errors += s.decode_errors;
        if s.saw_loss {
            lossy += 1;
        }
        if s.decode_errors > 0 || s.saw_loss {
            log::warn!("thread {}: {} decode error(s), data_loss={}", s.tid, s.decode_errors, s.saw_loss);
        } else {
            log::debug!("thread {}: clean decode", s.tid);
        }
    }
    log::info!(
        "{} thread(s) decoded, {} decode error(s) total, {} thread(s) saw AUX loss",
        summaries.len(),
        decode_errors,
        lossy
    );
}
