//! # Worker process
//!
//! One worker runs one node. The supervisor spawns it with its contract in
//! the environment:
//!
//! - `program`: path to the compiled artifact (typed operation + schemas)
//! - `input_ringbuf`: this node's input ring buffer (absent for sources)
//! - `output_ringbufs_ref`: file listing the ring buffers to fan out into,
//!   one path per line, re-read whenever its mtime changes
//! - `report_url`: where to PUT periodic telemetry
//! - `debug`: verbose logging
//!
//! Tuple processing is single-threaded; telemetry runs on a helper thread.
//! An unhandled error terminates this process only; the supervisor sees the
//! exit status.

use crate::codec::{decode_tuple, encode_tuple};
use crate::error::{Result, WeirError};
use crate::expr::{ListenProto, Operation};
use crate::ring::RingBuf;
use crate::runtime::{yield_tuple, AggregateRuntime, CsvSource, Program};
use crate::value::{Tuple, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const REPORT_PERIOD: Duration = Duration::from_secs(10);

/// Shared counters the report thread snapshots.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub tuples_in: AtomicU64,
    pub tuples_out: AtomicU64,
    pub groups: AtomicU64,
}

/// Output fan-out: the set of rings named by the ref file, re-read on
/// change so children can be rewired without restarting the worker.
struct Outputs {
    ref_path: PathBuf,
    mtime: Option<SystemTime>,
    rings: Vec<RingBuf>,
}

impl Outputs {
    fn new(ref_path: PathBuf) -> Result<Outputs> {
        let mut o = Outputs {
            ref_path,
            mtime: None,
            rings: Vec::new(),
        };
        o.refresh()?;
        Ok(o)
    }

    fn refresh(&mut self) -> Result<()> {
        let meta = std::fs::metadata(&self.ref_path)?;
        let mtime = meta.modified().ok();
        if mtime == self.mtime && !self.rings.is_empty() {
            return Ok(());
        }
        let listing = std::fs::read_to_string(&self.ref_path)?;
        let mut rings = Vec::new();
        for line in listing.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let ring = RingBuf::open(Path::new(line))?;
            ring.producer_recover();
            rings.push(ring);
        }
        debug!(outputs = rings.len(), "output fan-out refreshed");
        self.mtime = mtime;
        self.rings = rings;
        Ok(())
    }

    /// Fan one message out to every ring, blocking on backpressure.
    fn send(&mut self, words: &[u32]) -> Result<()> {
        for ring in &self.rings {
            let mut backoff = Backoff::new();
            loop {
                match ring.enqueue(words) {
                    Ok(()) => break,
                    Err(WeirError::NoSpace) => backoff.wait(),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// Spin a little, then sleep: the blocking strategy for an empty input and
/// a full output.
struct Backoff {
    rounds: u32,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff { rounds: 0 }
    }

    fn wait(&mut self) {
        if self.rounds < 64 {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.rounds = self.rounds.saturating_add(1);
    }

    fn reset(&mut self) {
        self.rounds = 0;
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

fn spawn_report_thread(report_url: String, stats: Arc<WorkerStats>) {
    std::thread::spawn(move || {
        let client = match reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("cannot build report client: {e}");
                return;
            }
        };
        loop {
            std::thread::sleep(REPORT_PERIOD);
            let body = serde_json::json!({
                "time": now_seconds(),
                "tuples_in": stats.tuples_in.load(Ordering::Relaxed),
                "tuples_out": stats.tuples_out.load(Ordering::Relaxed),
                "groups": stats.groups.load(Ordering::Relaxed),
            });
            if let Err(e) = client.put(&report_url).json(&body).send() {
                debug!("report failed: {e}");
            }
        }
    });
}

/// Entry point of `weir worker`. The environment carries the contract.
pub fn run() -> Result<()> {
    let program_path = std::env::var("program")
        .map_err(|_| WeirError::fatal("worker started without a program"))?;
    let program = Program::load(Path::new(&program_path))?;
    info!(signature = %program.signature, "worker starting");

    let stats = Arc::new(WorkerStats::default());
    if let Ok(url) = std::env::var("report_url") {
        spawn_report_thread(url, Arc::clone(&stats));
    }

    let ref_path = std::env::var("output_ringbufs_ref")
        .map_err(|_| WeirError::fatal("worker started without output_ringbufs_ref"))?;
    let mut outputs = Outputs::new(PathBuf::from(ref_path))?;

    match &program.operation {
        Operation::Yield { fields, every } => {
            run_yield(&program, fields, *every, &mut outputs, &stats)
        }
        Operation::ReadCsv {
            path,
            separator,
            has_header,
            ..
        } => run_csv(&program, path, *separator, *has_header, &mut outputs, &stats),
        Operation::Listen { proto } => run_listen(&program, *proto, &mut outputs, &stats),
        Operation::Aggregate(_) => run_aggregate(&program, &mut outputs, &stats),
    }
}

fn send_tuple(
    program: &Program,
    outputs: &mut Outputs,
    stats: &WorkerStats,
    tuple: &Tuple,
) -> Result<()> {
    let words = encode_tuple(&program.out_schema, tuple)?;
    outputs.send(&words)?;
    stats.tuples_out.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn run_yield(
    program: &Program,
    fields: &[crate::expr::SelectField],
    every: Option<f64>,
    outputs: &mut Outputs,
    stats: &WorkerStats,
) -> Result<()> {
    loop {
        outputs.refresh()?;
        let tuple = yield_tuple(fields, &program.in_schema, &program.out_schema)?;
        send_tuple(program, outputs, stats, &tuple)?;
        let pause = every.unwrap_or(0.001);
        std::thread::sleep(Duration::from_secs_f64(pause.max(0.0001)));
    }
}

fn run_csv(
    program: &Program,
    path: &str,
    separator: char,
    has_header: bool,
    outputs: &mut Outputs,
    stats: &WorkerStats,
) -> Result<()> {
    let mut source = CsvSource::open(path, separator, has_header, &program.out_schema)?;
    while let Some(tuple) = source.next_tuple()? {
        outputs.refresh()?;
        send_tuple(program, outputs, stats, &tuple)?;
    }
    info!("CSV source drained, exiting");
    Ok(())
}

fn run_listen(
    program: &Program,
    proto: ListenProto,
    outputs: &mut Outputs,
    stats: &WorkerStats,
) -> Result<()> {
    let ListenProto::Lines = proto;
    let addr = std::env::var("listen_addr").unwrap_or_else(|_| "127.0.0.1:28125".to_string());
    let listener = std::net::TcpListener::bind(&addr)?;
    info!(%addr, "listening for line traffic");

    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(conn) = conn else { continue };
            let tx = tx.clone();
            std::thread::spawn(move || {
                use std::io::BufRead;
                let reader = std::io::BufReader::new(conn);
                for line in reader.lines() {
                    match line {
                        Ok(l) => {
                            if tx.send(l).is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                }
            });
        }
    });

    loop {
        outputs.refresh()?;
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => {
                let tuple = vec![Value::Float(now_seconds()), Value::Str(line)];
                send_tuple(program, outputs, stats, &tuple)?;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                return Err(WeirError::fatal("listener thread died"));
            }
        }
    }
}

fn run_aggregate(program: &Program, outputs: &mut Outputs, stats: &WorkerStats) -> Result<()> {
    let input_path = std::env::var("input_ringbuf")
        .map_err(|_| WeirError::fatal("aggregate worker without input_ringbuf"))?;
    let input = RingBuf::open(Path::new(&input_path))?;
    input.consumer_recover();

    let mut rt = AggregateRuntime::new(program)?;
    let mut backoff = Backoff::new();
    loop {
        match input.dequeue()? {
            None => {
                backoff.wait();
                outputs.refresh()?;
            }
            Some(words) => {
                backoff.reset();
                stats.tuples_in.fetch_add(1, Ordering::Relaxed);
                let tuple = decode_tuple(&program.in_schema, &words)?;
                let outs = rt.process(&tuple)?;
                for out in &outs {
                    send_tuple(program, outputs, stats, out)?;
                }
                stats.groups.store(rt.group_count() as u64, Ordering::Relaxed);
            }
        }
    }
}
