use clap::Parser as ClapParser;
use std::{
    process,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use threadgc::{
    Collector, CollectorConfig, DiscoveryKind, MarkTask, ObjectKind, ParkingControl, SIZE_CLASSES,
    StackOwner,
};

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Stop-the-world stress driver", long_about = None)]
struct Cli {
    /// Mutator threads allocating concurrently
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Stop/scan/start cycles run by the collector thread
    #[arg(short, long, default_value_t = 20)]
    cycles: usize,

    /// Pause between cycles, in milliseconds
    #[arg(long, default_value_t = 5)]
    pause_ms: u64,

    /// Parallel marker helpers (0 disables parallel marking)
    #[arg(long, default_value_t = 0)]
    markers: usize,

    /// Discover threads through the fixed slot array
    #[arg(long)]
    implicit: bool,

    /// Suspend attempts per thread before aborting
    #[arg(long, default_value_t = 1_000_000)]
    retry_limit: u32,

    /// Allocations between blocking regions
    #[arg(long, default_value_t = 512)]
    blocking_every: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = CollectorConfig {
        discovery: if cli.implicit {
            DiscoveryKind::Implicit
        } else {
            DiscoveryKind::Explicit
        },
        markers: cli.markers,
        suspend_retry_limit: cli.retry_limit,
        ..CollectorConfig::default()
    };
    let control = Arc::new(ParkingControl::new(config.ack_timeout));
    let collector = match Collector::new(config, control) {
        Ok(collector) => collector,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(2);
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let allocated = Arc::new(AtomicU64::new(0));
    let started = Arc::new(Barrier::new(cli.threads + 1));

    let mut mutators = Vec::with_capacity(cli.threads);
    for n in 0..cli.threads {
        let stop = stop.clone();
        let allocated = allocated.clone();
        let started = started.clone();
        let blocking_every = cli.blocking_every.max(1);
        let spawned = collector.spawn(move |m| {
            started.wait();
            let mut count = 0u64;
            let mut held = Vec::new();
            while !stop.load(Ordering::Acquire) {
                let class = 1 + (count as usize + n) % (SIZE_CLASSES - 1);
                let kind = if count % 3 == 0 {
                    ObjectKind::PointerFree
                } else {
                    ObjectKind::Normal
                };
                match m.alloc_small(kind, class) {
                    Ok(block) => held.push((block, kind, class)),
                    Err(err) => {
                        log::error!("mutator {n}: {err}");
                        break;
                    }
                }
                if held.len() >= 64 {
                    for (block, kind, class) in held.drain(..) {
                        // SAFETY: allocated above and never handed out
                        unsafe { m.free_small(block, kind, class) };
                    }
                }
                count += 1;
                if count % blocking_every == 0 {
                    m.do_blocking(|| thread::sleep(Duration::from_micros(200)));
                }
            }
            allocated.fetch_add(count, Ordering::Relaxed);
            count
        });
        match spawned {
            Ok(thread) => mutators.push(thread),
            Err(err) => {
                eprintln!("Error: cannot start mutator {n}: {err}");
                process::exit(1);
            }
        }
    }
    started.wait();

    let run = Instant::now();
    for cycle in 0..cli.cycles {
        let begin = Instant::now();
        let stopped = collector.stop_world();
        let suspended = stopped.suspended_threads().len();
        let summary = stopped.for_each_thread_stack(|stack| {
            if let StackOwner::Mutator(id) = stack.owner {
                log::trace!("cycle {cycle}: thread {id} has {} ranges", stack.ranges.len());
            }
        });
        let mut cached = 0usize;
        stopped.mark_thread_local_free_lists(|_, _, _, _| cached += 1);
        stopped.parallel_mark(|task: MarkTask| {
            log::trace!("marker {} of {} ran generation {}", task.helper, task.helpers, task.generation);
        });
        stopped.start_world();
        println!(
            "cycle {cycle:>3}: {suspended} suspended, {} stacks, {} stack bytes, {cached} cached objects, {:?}",
            summary.threads,
            summary.bytes,
            begin.elapsed()
        );
        thread::sleep(Duration::from_millis(cli.pause_ms));
    }

    stop.store(true, Ordering::Release);
    for thread in mutators {
        if thread.join().is_err() {
            eprintln!("Error: a mutator panicked");
            process::exit(1);
        }
    }
    println!(
        "{} cycles in {:?}, {} allocations, {} world stops",
        cli.cycles,
        run.elapsed(),
        allocated.load(Ordering::Relaxed),
        collector.world_stops()
    );
}
