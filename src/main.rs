use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use twolockq::{BlockingQueue, QueueConfig, QueueStats};

#[derive(Parser, Debug)]
#[command(name = "twolockq")]
#[command(about = "Drive a bounded two-lock blocking queue with producer and consumer threads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Debug)]
struct QueueArgs {
    #[arg(long, default_value_t = 0, help = "Queue capacity (0 = unbounded)")]
    capacity: usize,
    #[arg(
        long,
        default_value_t = 5,
        help = "How long an idle consumer waits before checking whether producers are done"
    )]
    poll_ms: u64,
    #[arg(long, default_value_t = false, help = "Print the report as JSON")]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Many producers and consumers; checks every tag arrives exactly once
    Stress {
        #[arg(long, default_value_t = 4)]
        producers: usize,
        #[arg(long, default_value_t = 4)]
        consumers: usize,
        #[arg(long, default_value_t = 100_000)]
        items_per_producer: u64,
        #[command(flatten)]
        queue: QueueArgs,
    },
    /// One producer offering without blocking, one consumer draining in order
    Relay {
        #[arg(long, default_value_t = 10_000)]
        items: u64,
        #[command(flatten)]
        queue: QueueArgs,
    },
}

#[derive(Debug, Serialize)]
struct RunReport {
    mode: &'static str,
    capacity: usize,
    producers: usize,
    consumers: usize,
    items_sent: u64,
    items_received: u64,
    duplicates: u64,
    missing: u64,
    out_of_order: u64,
    full_retries: u64,
    duration_sec: f64,
    throughput_items_per_sec: f64,
    queue: QueueStats,
}

impl RunReport {
    fn is_clean(&self) -> bool {
        self.duplicates == 0 && self.missing == 0 && self.out_of_order == 0
    }
}

fn tag(producer: u64, seq: u64) -> u64 {
    (producer << 32) | seq
}

/// Blocking insert that gives up once `aborted` is raised, so a failed run
/// never leaves a producer parked on a full queue.
fn insert_unless_aborted(
    queue: &BlockingQueue<u64>,
    mut item: u64,
    poll: Duration,
    aborted: &AtomicBool,
) -> Result<()> {
    loop {
        match queue.insert_timeout(item, poll) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_timeout() => {
                if aborted.load(Ordering::Acquire) {
                    bail!("run aborted");
                }
                item = err.into_inner();
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn run_stress(
    producers: usize,
    consumers: usize,
    items_per_producer: u64,
    args: &QueueArgs,
) -> Result<RunReport> {
    if producers == 0 || consumers == 0 {
        bail!("need at least one producer and one consumer");
    }
    if items_per_producer > u64::from(u32::MAX) {
        bail!("items_per_producer must fit in 32 bits, got {items_per_producer}");
    }

    let queue = BlockingQueue::with_config(QueueConfig::bounded(args.capacity));
    let poll = Duration::from_millis(args.poll_ms.max(1));
    let producers_left = AtomicUsize::new(producers);
    let aborted = AtomicBool::new(false);
    info!(
        producers,
        consumers,
        items_per_producer,
        capacity = queue.capacity(),
        "starting stress run"
    );

    let started = Instant::now();
    let received: Vec<Vec<u64>> = thread::scope(|s| -> Result<Vec<Vec<u64>>> {
        let mut producer_handles = Vec::with_capacity(producers);
        for p in 0..producers as u64 {
            let queue = &queue;
            let producers_left = &producers_left;
            let aborted = &aborted;
            let handle = thread::Builder::new()
                .name(format!("producer-{p}"))
                .spawn_scoped(s, move || -> Result<()> {
                    let result = (0..items_per_producer).try_for_each(|seq| {
                        insert_unless_aborted(queue, tag(p, seq), poll, aborted)
                            .with_context(|| format!("producer {p} failed at item {seq}"))
                    });
                    producers_left.fetch_sub(1, Ordering::AcqRel);
                    debug!(producer = p, "producer finished");
                    result
                })
                .map_err(|err| {
                    aborted.store(true, Ordering::Release);
                    anyhow::Error::new(err).context("failed spawning producer thread")
                })?;
            producer_handles.push(handle);
        }

        let mut consumer_handles = Vec::with_capacity(consumers);
        for c in 0..consumers {
            let queue = &queue;
            let producers_left = &producers_left;
            let aborted = &aborted;
            let handle = thread::Builder::new()
                .name(format!("consumer-{c}"))
                .spawn_scoped(s, move || {
                    let mut got = Vec::new();
                    loop {
                        match queue.remove_timeout(poll) {
                            Some(tag) => got.push(tag),
                            None if aborted.load(Ordering::Acquire) => break,
                            None if producers_left.load(Ordering::Acquire) == 0
                                && queue.is_empty() =>
                            {
                                break;
                            }
                            None => {}
                        }
                    }
                    debug!(consumer = c, received = got.len(), "consumer finished");
                    got
                })
                .map_err(|err| {
                    aborted.store(true, Ordering::Release);
                    anyhow::Error::new(err).context("failed spawning consumer thread")
                })?;
            consumer_handles.push(handle);
        }

        for handle in producer_handles {
            handle
                .join()
                .map_err(|_| anyhow!("producer thread panicked"))??;
        }
        consumer_handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| anyhow!("consumer thread panicked")))
            .collect()
    })?;
    let duration = started.elapsed();

    let items_sent = producers as u64 * items_per_producer;
    let mut seen = HashSet::with_capacity(items_sent as usize);
    let mut duplicates = 0u64;
    let mut out_of_order = 0u64;
    for per_consumer in &received {
        // A single consumer must see each producer's tags in increasing order.
        let mut last_seq = vec![None::<u64>; producers];
        for &t in per_consumer {
            if !seen.insert(t) {
                duplicates += 1;
            }
            let (p, seq) = ((t >> 32) as usize, t & u64::from(u32::MAX));
            if let Some(slot) = last_seq.get_mut(p) {
                if slot.is_some_and(|last| seq <= last) {
                    out_of_order += 1;
                }
                *slot = Some(seq);
            }
        }
    }
    let items_received = received.iter().map(|v| v.len() as u64).sum();

    Ok(RunReport {
        mode: "stress",
        capacity: queue.capacity(),
        producers,
        consumers,
        items_sent,
        items_received,
        duplicates,
        missing: items_sent.saturating_sub(seen.len() as u64),
        out_of_order,
        full_retries: 0,
        duration_sec: duration.as_secs_f64(),
        throughput_items_per_sec: items_received as f64 / duration.as_secs_f64().max(0.000_001),
        queue: queue.stats(),
    })
}

/// Offer `0..items` without blocking, spinning on `Full`. Returns how many
/// offers were rejected.
fn offer_all(queue: &BlockingQueue<u64>, items: u64) -> Result<u64> {
    // Retrying a rejected offer is the caller's business, not the queue's.
    let mut full_retries = 0u64;
    for i in 0..items {
        let mut pending = i;
        loop {
            match queue.try_insert(pending) {
                Ok(()) => break,
                Err(err) if err.is_full() => {
                    full_retries += 1;
                    pending = err.into_inner();
                    thread::yield_now();
                }
                Err(err) => return Err(err).context("relay producer failed"),
            }
        }
    }
    Ok(full_retries)
}

fn run_relay(items: u64, args: &QueueArgs) -> Result<RunReport> {
    let queue = BlockingQueue::with_config(QueueConfig::bounded(args.capacity));
    let poll = Duration::from_millis(args.poll_ms.max(1));
    let producer_done = AtomicBool::new(false);
    info!(items, capacity = queue.capacity(), "starting relay run");

    let started = Instant::now();
    let (full_retries, received) = thread::scope(|s| -> Result<(u64, Vec<u64>)> {
        let queue = &queue;
        let producer_done = &producer_done;
        let consumer = thread::Builder::new()
            .name("consumer".to_string())
            .spawn_scoped(s, move || {
                let mut got = Vec::new();
                while (got.len() as u64) < items {
                    match queue.remove_timeout(poll) {
                        Some(value) => got.push(value),
                        None if producer_done.load(Ordering::Acquire) && queue.is_empty() => {
                            break;
                        }
                        None => {}
                    }
                }
                got
            })
            .context("failed spawning consumer thread")?;

        // The consumer only stops early once the producer is done, whether it
        // finished or failed.
        let offered = offer_all(queue, items);
        producer_done.store(true, Ordering::Release);

        let received = consumer
            .join()
            .map_err(|_| anyhow!("consumer thread panicked"))?;
        Ok((offered?, received))
    })?;
    let duration = started.elapsed();

    let mut out_of_order = 0u64;
    for pair in received.windows(2) {
        if pair[1] != pair[0] + 1 {
            warn!(current = pair[1], last = pair[0], "relay gap");
            out_of_order += 1;
        }
    }
    let unique: HashSet<u64> = received.iter().copied().collect();

    Ok(RunReport {
        mode: "relay",
        capacity: queue.capacity(),
        producers: 1,
        consumers: 1,
        items_sent: items,
        items_received: received.len() as u64,
        duplicates: received.len() as u64 - unique.len() as u64,
        missing: items.saturating_sub(unique.len() as u64),
        out_of_order,
        full_retries,
        duration_sec: duration.as_secs_f64(),
        throughput_items_per_sec: received.len() as f64 / duration.as_secs_f64().max(0.000_001),
        queue: queue.stats(),
    })
}

fn write_report(out: &mut impl Write, report: &RunReport) -> io::Result<()> {
    writeln!(out, "mode={}", report.mode)?;
    writeln!(out, "capacity={}", report.capacity)?;
    writeln!(out, "producers={}", report.producers)?;
    writeln!(out, "consumers={}", report.consumers)?;
    writeln!(out, "duration_sec={:.3}", report.duration_sec)?;
    writeln!(out, "items_sent={}", report.items_sent)?;
    writeln!(out, "items_received={}", report.items_received)?;
    writeln!(out, "duplicates={}", report.duplicates)?;
    writeln!(out, "missing={}", report.missing)?;
    writeln!(out, "out_of_order={}", report.out_of_order)?;
    writeln!(out, "full_retries={}", report.full_retries)?;
    writeln!(
        out,
        "throughput_items_per_sec={:.2}",
        report.throughput_items_per_sec
    )?;
    writeln!(out, "queue.inserted={}", report.queue.inserted)?;
    writeln!(out, "queue.removed={}", report.queue.removed)?;
    writeln!(out, "queue.rejected_full={}", report.queue.rejected_full)?;
    writeln!(out, "queue.alloc_failures={}", report.queue.alloc_failures)?;
    writeln!(out, "queue.timeouts={}", report.queue.timeouts)?;
    writeln!(out, "queue.cleared={}", report.queue.cleared)?;
    writeln!(out, "queue.max_len={}", report.queue.max_len)?;
    Ok(())
}

fn main() -> Result<()> {
    twolockq::trace::init_tracing()?;
    let cli = Cli::parse();

    let (report, json) = match cli.command {
        Command::Stress {
            producers,
            consumers,
            items_per_producer,
            queue,
        } => (
            run_stress(producers, consumers, items_per_producer, &queue)?,
            queue.json,
        ),
        Command::Relay { items, queue } => (run_relay(items, &queue)?, queue.json),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed serializing report")?
        );
    } else {
        write_report(&mut io::stdout().lock(), &report).context("failed writing report")?;
    }

    if !report.is_clean() {
        bail!(
            "queue lost, duplicated or reordered elements: missing={} duplicates={} out_of_order={}",
            report.missing,
            report.duplicates,
            report.out_of_order
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn args(capacity: usize) -> QueueArgs {
        QueueArgs {
            capacity,
            poll_ms: 1,
            json: false,
        }
    }

    #[test]
    fn stress_run_is_clean() {
        let report = run_stress(3, 2, 2_000, &args(8)).expect("stress run");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.items_received, 6_000);
        assert!(report.queue.max_len <= 8);
    }

    #[test]
    fn relay_through_unbounded_queue_never_retries() {
        let report = run_relay(10_000, &args(0)).expect("relay run");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.full_retries, 0);
        assert_eq!(report.items_received, 10_000);
    }

    #[test]
    fn relay_through_tiny_queue_stays_in_order() {
        let report = run_relay(2_000, &args(2)).expect("relay run");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.items_received, 2_000);
    }

    #[test]
    fn relay_reports_a_failed_producer_instead_of_hanging() {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            // Injection is per thread; the relay producer runs on this one.
            twolockq::chaos::inject_alloc_failures(1);
            let _ = tx.send(run_relay(10, &args(4)).map(|report| report.items_received));
        });

        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("relay returned");
        let err = result.expect_err("allocation failure surfaces");
        assert!(format!("{err:#}").contains("relay producer failed"), "{err:#}");
    }

    #[test]
    fn aborted_insert_stops_waiting_on_a_full_queue() {
        let queue = BlockingQueue::new(1);
        queue.insert(1u64).expect("fits");
        let aborted = AtomicBool::new(true);

        let err = insert_unless_aborted(&queue, 2, Duration::from_millis(1), &aborted)
            .expect_err("run aborted");
        assert!(err.to_string().contains("aborted"));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.remove(), 1);
        insert_unless_aborted(&queue, 3, Duration::from_millis(1), &aborted)
            .expect("space available");
        assert_eq!(queue.remove(), 3);
    }

    #[test]
    fn stress_rejects_oversized_producer_batches() {
        assert!(run_stress(1, 1, u64::from(u32::MAX) + 1, &args(1)).is_err());
        assert!(run_stress(0, 1, 10, &args(1)).is_err());
    }

    #[test]
    fn key_value_report_carries_every_queue_counter() {
        let report = run_relay(100, &args(4)).expect("relay run");
        let mut out = Vec::new();
        write_report(&mut out, &report).expect("write to memory");
        let text = String::from_utf8(out).expect("utf-8 report");

        let json = serde_json::to_value(&report.queue).expect("serialize stats");
        for key in json.as_object().expect("stats object").keys() {
            assert!(
                text.lines().any(|line| line.starts_with(&format!("queue.{key}="))),
                "missing queue.{key} in:\n{text}"
            );
        }
        assert!(text.contains("items_received=100\n"));
    }

    #[test]
    fn cli_parses_flattened_queue_args() {
        let cli = Cli::try_parse_from([
            "twolockq",
            "stress",
            "--producers",
            "2",
            "--capacity",
            "16",
            "--json",
        ])
        .expect("valid args");
        match cli.command {
            Command::Stress {
                producers, queue, ..
            } => {
                assert_eq!(producers, 2);
                assert_eq!(queue.capacity, 16);
                assert!(queue.json);
            }
            Command::Relay { .. } => panic!("expected stress"),
        }
    }
}
