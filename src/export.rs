//! # Tuple export & time-series slicing
//!
//! Exported nodes fork their output into a dedicated ring buffer; a drain
//! thread per node consumes it into a bounded in-memory window of the most
//! recent tuples, tagged with sequence numbers. The window serves ad-hoc
//! inspection (`fold_tuples`) and time-series queries (`build_timeseries`)
//! for nodes that declared event-time info.

use crate::codec::decode_tuple;
use crate::error::{Result, WeirError};
use crate::expr::{EventDuration, EventTime};
use crate::ring::RingBuf;
use crate::schema::TupleSchema;
use crate::value::Tuple;
use crossbeam_channel::{bounded, Sender, TryRecvError};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-bucket consolidation of a time-series query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consolidation {
    Min,
    Max,
    Avg,
}

/// Retained window of one exported node.
#[derive(Debug)]
struct NodeWindow {
    schema: TupleSchema,
    event_time: Option<EventTime>,
    tuples: VecDeque<(u64, Tuple)>,
    next_seq: u64,
}

/// All retained windows, keyed by fully qualified node name.
pub struct ExportStore {
    nodes: DashMap<String, NodeWindow>,
    max_tuples: usize,
}

impl ExportStore {
    pub fn new(max_tuples: usize) -> ExportStore {
        ExportStore {
            nodes: DashMap::new(),
            max_tuples: max_tuples.max(1),
        }
    }

    /// Declare an exported node. Idempotent; keeps prior tuples when the
    /// schema is unchanged so a restart does not wipe the window.
    pub fn register(&self, fq: &str, schema: TupleSchema, event_time: Option<EventTime>) {
        match self.nodes.get_mut(fq) {
            Some(mut w) if w.schema == schema => {
                w.event_time = event_time;
            }
            _ => {
                self.nodes.insert(
                    fq.to_string(),
                    NodeWindow {
                        schema,
                        event_time,
                        tuples: VecDeque::new(),
                        next_seq: 0,
                    },
                );
            }
        }
    }

    pub fn push(&self, fq: &str, tuple: Tuple) {
        if let Some(mut w) = self.nodes.get_mut(fq) {
            let seq = w.next_seq;
            w.next_seq += 1;
            w.tuples.push_back((seq, tuple));
            while w.tuples.len() > self.max_tuples {
                w.tuples.pop_front();
            }
        }
    }

    pub fn schema(&self, fq: &str) -> Result<TupleSchema> {
        self.nodes
            .get(fq)
            .map(|w| w.schema.clone())
            .ok_or_else(|| WeirError::not_found(format!("no export for node '{fq}'")))
    }

    /// Latest sequence number handed out, if any tuple arrived yet.
    pub fn last_seq(&self, fq: &str) -> Option<u64> {
        self.nodes
            .get(fq)
            .and_then(|w| w.next_seq.checked_sub(1))
    }

    /// Retained tuples with sequence numbers, gated by `since`, newest last.
    pub fn fold_tuples(
        &self,
        fq: &str,
        since: Option<u64>,
        max_res: Option<usize>,
    ) -> Result<Vec<(u64, Tuple)>> {
        let w = self
            .nodes
            .get(fq)
            .ok_or_else(|| WeirError::not_found(format!("no export for node '{fq}'")))?;
        let mut out: Vec<(u64, Tuple)> = w
            .tuples
            .iter()
            .filter(|(seq, _)| since.is_none_or(|s| *seq > s))
            .cloned()
            .collect();
        if let Some(max) = max_res {
            // keep the most recent rows when the caller caps the count
            if out.len() > max {
                out.drain(..out.len() - max);
            }
        }
        Ok(out)
    }

    /// Bucket the retained tuples of `fq` into `max_points` uniform buckets
    /// over `[from, to]`; empty buckets yield None.
    pub fn build_timeseries(
        &self,
        fq: &str,
        data_field: &str,
        max_points: usize,
        from: f64,
        to: f64,
        consolidation: Consolidation,
    ) -> Result<Vec<(f64, Option<f64>)>> {
        if max_points == 0 || to <= from {
            return Err(WeirError::invalid("empty time range"));
        }
        let w = self
            .nodes
            .get(fq)
            .ok_or_else(|| WeirError::not_found(format!("no export for node '{fq}'")))?;
        let et = w.event_time.as_ref().ok_or_else(|| {
            WeirError::invalid(format!(
                "node '{fq}' declares no event time and cannot be time-series queried"
            ))
        })?;
        let start_rank = w
            .schema
            .rank(&et.start_field)
            .ok_or_else(|| WeirError::not_found(format!("field '{}'", et.start_field)))?;
        let data_rank = w
            .schema
            .rank(data_field)
            .ok_or_else(|| WeirError::not_found(format!("field '{data_field}'")))?;
        let stop_rank = match &et.duration {
            EventDuration::StopField { name, .. } => Some(
                w.schema
                    .rank(name)
                    .ok_or_else(|| WeirError::not_found(format!("field '{name}'")))?,
            ),
            EventDuration::Const(_) => None,
        };

        let width = (to - from) / max_points as f64;
        let mut mins = vec![f64::INFINITY; max_points];
        let mut maxs = vec![f64::NEG_INFINITY; max_points];
        let mut sums = vec![0.0f64; max_points];
        let mut counts = vec![0u64; max_points];

        for (_, tuple) in &w.tuples {
            let Some(start) = tuple[start_rank].as_f64() else {
                continue;
            };
            let start = start * et.start_scale;
            let stop = match (&et.duration, stop_rank) {
                (EventDuration::Const(d), _) => start + d,
                (EventDuration::StopField { scale, .. }, Some(r)) => {
                    match tuple[r].as_f64() {
                        Some(s) => s * scale,
                        None => start,
                    }
                }
                (EventDuration::StopField { .. }, None) => start,
            };
            let Some(value) = tuple[data_rank].as_f64() else {
                continue;
            };
            if stop < from || start > to {
                continue;
            }
            // attribute the event to every bucket it overlaps
            let first = (((start - from) / width).floor().max(0.0)) as usize;
            let last = (((stop - from) / width).floor()) as usize;
            for b in first..=last.min(max_points - 1) {
                mins[b] = mins[b].min(value);
                maxs[b] = maxs[b].max(value);
                sums[b] += value;
                counts[b] += 1;
            }
        }

        let mut points = Vec::with_capacity(max_points);
        for b in 0..max_points {
            let t = from + width * b as f64;
            let v = if counts[b] == 0 {
                None
            } else {
                Some(match consolidation {
                    Consolidation::Min => mins[b],
                    Consolidation::Max => maxs[b],
                    Consolidation::Avg => sums[b] / counts[b] as f64,
                })
            };
            points.push((t, v));
        }
        Ok(points)
    }
}

/// Handle of one running drain thread; dropping the sender stops it.
pub struct ExportDrain {
    stop: Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ExportDrain {
    /// Consume an export ring buffer into the store until stopped.
    pub fn spawn(store: Arc<ExportStore>, fq: String, ring_path: PathBuf) -> Result<ExportDrain> {
        let schema = store.schema(&fq)?;
        let (stop, stopped) = bounded::<()>(1);
        let handle = std::thread::spawn(move || {
            let ring = match RingBuf::open(&ring_path) {
                Ok(r) => r,
                Err(e) => {
                    warn!(node = %fq, "export drain cannot open ring: {e}");
                    return;
                }
            };
            ring.consumer_recover();
            loop {
                match stopped.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }
                match ring.dequeue() {
                    Ok(Some(words)) => match decode_tuple(&schema, &words) {
                        Ok(tuple) => store.push(&fq, tuple),
                        Err(e) => {
                            warn!(node = %fq, "export drain decode error: {e}");
                        }
                    },
                    Ok(None) => std::thread::sleep(Duration::from_millis(5)),
                    Err(e) => {
                        warn!(node = %fq, "export drain ring error: {e}");
                        break;
                    }
                }
            }
            debug!(node = %fq, "export drain stopped");
        });
        Ok(ExportDrain {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ExprType;
    use crate::value::{ScalarType, Value};

    fn schema() -> TupleSchema {
        let mut s = TupleSchema::new();
        s.push("time", ExprType::typed("time", ScalarType::Float, false))
            .expect("push");
        s.push("value", ExprType::typed("value", ScalarType::Float, false))
            .expect("push");
        s.set_finished();
        s
    }

    fn event_time() -> EventTime {
        EventTime {
            start_field: "time".to_string(),
            start_scale: 1.0,
            duration: EventDuration::Const(0.0),
        }
    }

    #[test]
    fn window_is_bounded_and_sequenced() {
        let store = ExportStore::new(3);
        store.register("l/n", schema(), None);
        for i in 0..5 {
            store.push("l/n", vec![Value::Float(i as f64), Value::Float(0.0)]);
        }
        let all = store.fold_tuples("l/n", None, None).expect("fold");
        let seqs: Vec<u64> = all.iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn since_gates_by_sequence_number() {
        let store = ExportStore::new(100);
        store.register("l/n", schema(), None);
        for i in 0..10 {
            store.push("l/n", vec![Value::Float(i as f64), Value::Float(0.0)]);
        }
        let tail = store.fold_tuples("l/n", Some(6), None).expect("fold");
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].0, 7);
        let capped = store.fold_tuples("l/n", None, Some(2)).expect("fold");
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].0, 8);
    }

    #[test]
    fn timeseries_buckets_with_nulls() {
        let store = ExportStore::new(100);
        store.register("l/n", schema(), Some(event_time()));
        for (t, v) in [(5.0, 10.0), (6.0, 30.0), (25.0, 100.0)] {
            store.push("l/n", vec![Value::Float(t), Value::Float(v)]);
        }
        let pts = store
            .build_timeseries("l/n", "value", 4, 0.0, 40.0, Consolidation::Avg)
            .expect("timeseries");
        assert_eq!(pts.len(), 4);
        assert_eq!(pts[0].1, Some(20.0)); // avg(10, 30) in [0,10)
        assert_eq!(pts[1].1, None); // [10,20) empty
        assert_eq!(pts[2].1, Some(100.0)); // [20,30)
        assert_eq!(pts[3].1, None);
    }

    #[test]
    fn timeseries_needs_event_time() {
        let store = ExportStore::new(10);
        store.register("l/n", schema(), None);
        store.push("l/n", vec![Value::Float(0.0), Value::Float(0.0)]);
        assert!(store
            .build_timeseries("l/n", "value", 4, 0.0, 10.0, Consolidation::Min)
            .is_err());
    }

    #[test]
    fn consolidation_modes_differ() {
        let store = ExportStore::new(100);
        store.register("l/n", schema(), Some(event_time()));
        for v in [1.0, 2.0, 3.0] {
            store.push("l/n", vec![Value::Float(0.5), Value::Float(v)]);
        }
        let min = store
            .build_timeseries("l/n", "value", 1, 0.0, 1.0, Consolidation::Min)
            .expect("ts");
        let max = store
            .build_timeseries("l/n", "value", 1, 0.0, 1.0, Consolidation::Max)
            .expect("ts");
        assert_eq!(min[0].1, Some(1.0));
        assert_eq!(max[0].1, Some(3.0));
    }
}
