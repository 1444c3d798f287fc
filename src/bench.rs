// Benchmark harness for the dispatcher.
//
// Purpose:
// - Provide a simple, repeatable baseline for claim throughput under producer contention
//   with one or more subscriptions draining concurrently.
// - Emit machine-readable JSON to stdout and a human-readable table to stderr.
//
// Design notes:
// - Uses scoped threads; producers spin then yield on backpressure.
// - Subscribers check per-stream ordering so a run doubles as a smoke test.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use logbuffer::api::{
    ClaimResult, ClaimedFragment, ClaimedFragmentBatch, Dispatcher, DispatcherOptions, Error,
    ErrorKind, FragmentAction, FragmentHandler, FragmentRef, Subscription,
};
use logbuffer::core::frame;

const SPINS_BEFORE_YIELD: u32 = 64;
const POLL_LIMIT: usize = 256;

#[derive(Clone, Debug)]
pub struct BenchArgs {
    pub buffer_size: usize,
    pub payload_sizes: Vec<usize>,
    pub messages: u64,
    pub producers: Vec<usize>,
    pub subscribers: usize,
    pub batch: usize,
    pub format: BenchFormat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BenchFormat {
    Json,
    Table,
    Both,
}

impl BenchFormat {
    pub fn parse(input: &str) -> Result<Self, Error> {
        match input.trim() {
            "json" => Ok(Self::Json),
            "table" => Ok(Self::Table),
            "both" => Ok(Self::Both),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("invalid --format (use json|table|both)")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct RunParams {
    payload_bytes: usize,
    messages: u64,
    producers: usize,
    subscribers: usize,
    batch: usize,
}

#[derive(Debug, Default)]
struct RunStats {
    duration: Duration,
    backpressure: u64,
    final_term: u32,
}

pub fn run_bench(args: BenchArgs, program_version: &str) -> Result<(), Error> {
    let start = SystemTime::now();
    if args.payload_sizes.iter().any(|size| *size < 8) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--payload-bytes must be at least 8 (sequence number)"));
    }

    let mut results = Vec::new();
    for payload_bytes in &args.payload_sizes {
        for producers in &args.producers {
            let params = RunParams {
                payload_bytes: *payload_bytes,
                messages: args.messages,
                producers: (*producers).max(1),
                subscribers: args.subscribers,
                batch: args.batch,
            };
            let stats = run_once(args.buffer_size, params)?;
            results.push(result_entry(args.buffer_size, params, &stats));
        }
    }

    let output = json!({
        "name": "logbuffer",
        "version": program_version,
        "ts": rfc3339_now(start),
        "system": system_json(),
        "params": {
            "buffer_size": args.buffer_size,
            "payload_sizes": args.payload_sizes,
            "messages": args.messages,
            "producers": args.producers,
            "subscribers": args.subscribers,
            "batch": args.batch,
            "debug_build": cfg!(debug_assertions),
        },
        "results": results,
    });

    emit_bench_output(output, args.format)
}

fn run_once(buffer_size: usize, params: RunParams) -> Result<RunStats, Error> {
    let fragments = params.batch.max(1);
    let max_fragment_length =
        frame::batch_length(fragments, fragments * params.payload_bytes).max(params.payload_bytes);
    let dispatcher = Dispatcher::new(
        DispatcherOptions::new(buffer_size)
            .with_name("bench")
            .with_max_fragment_length(max_fragment_length)
            .with_max_subscriptions(params.subscribers.max(1)),
    )?;

    let subscriptions = (0..params.subscribers)
        .map(|index| dispatcher.open_subscription(format!("bench-sub-{index}")))
        .collect::<Result<Vec<_>, Error>>()?;
    let expected = params.messages * params.producers as u64;
    let backpressure = AtomicU64::new(0);

    tracing::debug!(
        producers = params.producers,
        subscribers = params.subscribers,
        payload_bytes = params.payload_bytes,
        batch = params.batch,
        "bench run starting"
    );

    let started = Instant::now();
    let outcome = thread::scope(|scope| {
        let readers: Vec<_> = subscriptions
            .into_iter()
            .map(|subscription| {
                scope.spawn(move || drain(subscription, expected, params.producers))
            })
            .collect();
        let writers: Vec<_> = (0..params.producers)
            .map(|producer| {
                let dispatcher = &dispatcher;
                let backpressure = &backpressure;
                scope.spawn(move || {
                    let result = produce(dispatcher, producer, params, backpressure);
                    if result.is_err() {
                        // Unblocks subscribers still waiting for this producer's messages.
                        dispatcher.close();
                    }
                    result
                })
            })
            .collect();

        let mut first_error = None;
        for handle in writers.into_iter().chain(readers) {
            let result = handle.join().unwrap_or_else(|_| {
                Err(Error::new(ErrorKind::Internal).with_message("bench thread panicked"))
            });
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    });
    let duration = started.elapsed();
    outcome?;

    let final_term = dispatcher.publisher_position().term();
    dispatcher.close();
    Ok(RunStats {
        duration,
        backpressure: backpressure.load(Ordering::Relaxed),
        final_term,
    })
}

fn produce(
    dispatcher: &Dispatcher,
    producer: usize,
    params: RunParams,
    backpressure: &AtomicU64,
) -> Result<(), Error> {
    let stream_id = producer as i32;
    let mut sequence = 0u64;
    let mut spins = 0u32;
    while sequence < params.messages {
        let claimed = if params.batch == 0 {
            claim_one(dispatcher, params.payload_bytes, stream_id, sequence)?
        } else {
            let count = (params.batch as u64).min(params.messages - sequence) as usize;
            claim_many(dispatcher, params.payload_bytes, stream_id, sequence, count)?
        };
        match claimed {
            Some(count) => {
                sequence += count;
                spins = 0;
            }
            None => {
                backpressure.fetch_add(1, Ordering::Relaxed);
                back_off(&mut spins);
            }
        }
    }
    Ok(())
}

fn claim_one(
    dispatcher: &Dispatcher,
    payload_bytes: usize,
    stream_id: i32,
    sequence: u64,
) -> Result<Option<u64>, Error> {
    let mut claim = ClaimedFragment::new();
    match dispatcher.claim_single_fragment(&mut claim, payload_bytes, stream_id)? {
        ClaimResult::Claimed(_) => {
            fill_payload(claim.buffer_mut(), sequence);
            claim.commit();
            Ok(Some(1))
        }
        ClaimResult::PartitionFull | ClaimResult::EndOfPartition => Ok(None),
        ClaimResult::Closed => Err(closed_error()),
    }
}

fn claim_many(
    dispatcher: &Dispatcher,
    payload_bytes: usize,
    stream_id: i32,
    sequence: u64,
    count: usize,
) -> Result<Option<u64>, Error> {
    let mut batch = ClaimedFragmentBatch::new();
    match dispatcher.claim_fragment_batch(&mut batch, count, count * payload_bytes)? {
        ClaimResult::Claimed(_) => {
            for index in 0..count {
                let mut fragment = batch.next_fragment(payload_bytes, stream_id)?;
                fill_payload(fragment.buffer_mut(), sequence + index as u64);
            }
            batch.commit();
            Ok(Some(count as u64))
        }
        ClaimResult::PartitionFull | ClaimResult::EndOfPartition => Ok(None),
        ClaimResult::Closed => Err(closed_error()),
    }
}

fn fill_payload(buffer: &mut [u8], sequence: u64) {
    buffer[..8].copy_from_slice(&sequence.to_le_bytes());
    buffer[8..].fill(0xA5);
}

struct OrderCheck {
    next: Vec<u64>,
    seen: u64,
    violation: Option<String>,
}

impl FragmentHandler for OrderCheck {
    fn on_fragment(&mut self, fragment: FragmentRef<'_>) -> FragmentAction {
        let stream = fragment.stream_id as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&fragment.payload[..8]);
        let sequence = u64::from_le_bytes(raw);
        match self.next.get_mut(stream) {
            Some(next) if *next == sequence => *next += 1,
            _ if self.violation.is_none() => {
                self.violation = Some(format!(
                    "stream {stream} delivered sequence {sequence} at {}",
                    fragment.position
                ));
            }
            _ => {}
        }
        self.seen += 1;
        FragmentAction::Consume
    }
}

fn drain(mut subscription: Subscription, expected: u64, producers: usize) -> Result<(), Error> {
    let mut check = OrderCheck {
        next: vec![0; producers],
        seen: 0,
        violation: None,
    };
    let mut spins = 0u32;
    while check.seen < expected {
        if subscription.poll(&mut check, POLL_LIMIT)? == 0 {
            back_off(&mut spins);
        } else {
            spins = 0;
        }
        if let Some(violation) = check.violation.take() {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("{}: {violation}", subscription.name()))
                .with_position(subscription.position()));
        }
    }
    subscription.close();
    Ok(())
}

fn back_off(spins: &mut u32) {
    if *spins < SPINS_BEFORE_YIELD {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        thread::yield_now();
    }
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Closed).with_message("dispatcher closed during bench")
}

fn emit_bench_output(value: Value, format: BenchFormat) -> Result<(), Error> {
    match format {
        BenchFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            Ok(())
        }
        BenchFormat::Table => {
            emit_table(&value)?;
            Ok(())
        }
        BenchFormat::Both => {
            println!("{}", serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string()));
            emit_table(&value)?;
            Ok(())
        }
    }
}

fn emit_table(value: &Value) -> Result<(), Error> {
    let write_error = |err: io::Error| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to write bench table")
            .with_source(err)
    };
    let mut stderr = io::stderr().lock();
    writeln!(stderr, "dispatch bench (table)").map_err(write_error)?;

    let results = value
        .get("results")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("bench results missing"))?;

    writeln!(
        stderr,
        "{:>8}  {:>10}  {:>9}  {:>5}  {:>5}  {:>10}  {:>12}  {:>9}  {:>6}",
        "bench", "buffer", "payload", "prod", "subs", "msgs", "msgs/s", "MiB/s", "terms"
    )
    .map_err(write_error)?;

    for item in results {
        let bench = item.get("bench").and_then(|v| v.as_str()).unwrap_or("?");
        let buffer = item.get("buffer_size").and_then(|v| v.as_u64()).unwrap_or(0);
        let payload = item.get("payload_bytes").and_then(|v| v.as_u64()).unwrap_or(0);
        let producers = item.get("producers").and_then(|v| v.as_u64()).unwrap_or(1);
        let subscribers = item.get("subscribers").and_then(|v| v.as_u64()).unwrap_or(0);
        let msgs = item.get("messages").and_then(|v| v.as_u64()).unwrap_or(0);
        let msgs_per_sec = item
            .get("msgs_per_sec")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let mb_per_sec = item
            .get("mb_per_sec")
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        let terms = item.get("final_term").and_then(|v| v.as_u64()).unwrap_or(0);

        writeln!(
            stderr,
            "{:>8}  {:>10}  {:>9}  {:>5}  {:>5}  {:>10}  {:>12.0}  {:>9.1}  {:>6}",
            bench,
            format_bytes(buffer),
            format_bytes(payload),
            producers,
            subscribers,
            msgs,
            msgs_per_sec,
            mb_per_sec,
            terms
        )
        .map_err(write_error)?;
    }

    Ok(())
}

fn result_entry(buffer_size: usize, params: RunParams, stats: &RunStats) -> Value {
    let messages = params.messages * params.producers as u64;
    let dur_ms = stats.duration.as_secs_f64() * 1000.0;
    let secs = stats.duration.as_secs_f64().max(1e-9);
    let mb = (params.payload_bytes as f64 * messages as f64) / (1024.0 * 1024.0);
    let bench = if params.batch == 0 { "claim" } else { "batch" };

    let mut map = BTreeMap::new();
    map.insert("bench".to_string(), json!(bench));
    map.insert("buffer_size".to_string(), json!(buffer_size));
    map.insert("payload_bytes".to_string(), json!(params.payload_bytes));
    map.insert("messages".to_string(), json!(messages));
    map.insert("producers".to_string(), json!(params.producers));
    map.insert("subscribers".to_string(), json!(params.subscribers));
    map.insert("batch".to_string(), json!(params.batch));
    map.insert("duration_ms".to_string(), json!(dur_ms));
    map.insert("msgs_per_sec".to_string(), json!(messages as f64 / secs));
    map.insert("mb_per_sec".to_string(), json!(mb / secs));
    map.insert("backpressure".to_string(), json!(stats.backpressure));
    map.insert("final_term".to_string(), json!(stats.final_term));
    Value::Object(map.into_iter().collect())
}

fn system_json() -> Value {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    json!({
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
    })
}

fn rfc3339_now(ts: SystemTime) -> String {
    let dur = ts.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = dur.as_secs() as i64;
    let nsec = dur.subsec_nanos();
    let tm = time::OffsetDateTime::from_unix_timestamp(secs).unwrap_or_else(|_| time::OffsetDateTime::UNIX_EPOCH);
    let tm = tm.replace_nanosecond(nsec).unwrap_or(tm);
    tm.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

fn format_bytes(value: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;

    let v = value as f64;
    if v >= GB {
        format!("{:.1}GiB", v / GB)
    } else if v >= MB {
        format!("{:.1}MiB", v / MB)
    } else if v >= KB {
        format!("{:.1}KiB", v / KB)
    } else {
        format!("{value}B")
    }
}

#[cfg(test)]
mod tests {
    use super::{BenchFormat, RunParams, format_bytes, run_once};

    #[test]
    fn format_parse_accepts_known_values() {
        assert_eq!(BenchFormat::parse("json").expect("json"), BenchFormat::Json);
        assert_eq!(BenchFormat::parse(" both ").expect("both"), BenchFormat::Both);
        assert!(BenchFormat::parse("csv").is_err());
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(4 * 1024 * 1024), "4.0MiB");
    }

    #[test]
    fn small_run_delivers_every_message() {
        for batch in [0, 4] {
            let params = RunParams {
                payload_bytes: 24,
                messages: 500,
                producers: 3,
                subscribers: 2,
                batch,
            };
            let stats = run_once(16 * 1024, params).expect("run");
            assert!(stats.final_term >= 1, "batch={batch}");
        }
    }
}
