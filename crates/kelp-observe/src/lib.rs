//! kelp-observe: vendor-neutral observability ABI.
//!
//! Storage crates depend only on these traits and event types. Backends live elsewhere.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: StoreEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: StoreEvent) {}
}

/// Typed events for live visualization (keys/values never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum StoreEvent {
    Commit(CommitEvt),
    Scan(ScanEvt),
    VBucket(VBucketEvt),
}

#[derive(Clone, Debug)]
pub struct CommitEvt {
    pub vbid: u16,
    pub kind: CommitKind,
}
#[derive(Clone, Debug)]
pub enum CommitKind {
    /// Durable batch landed.
    Flushed { docs: usize, bytes: u64 },
    /// An oversized batch was split and written early.
    BatchSplit { bytes: u64 },
    /// The re-read high seqno disagreed with the batch maximum.
    HighSeqnoMismatch { persisted: i64, expected: i64 },
}

#[derive(Clone, Debug)]
pub struct ScanEvt {
    pub vbid: u16,
    pub kind: ScanKind,
}
#[derive(Clone, Debug)]
pub enum ScanKind {
    Opened { scan_id: u64 },
    Paused { scan_id: u64, last_read_seqno: i64 },
    Closed { scan_id: u64 },
}

#[derive(Clone, Debug)]
pub struct VBucketEvt {
    pub vbid: u16,
    pub kind: VBucketKind,
}
#[derive(Clone, Debug)]
pub enum VBucketKind {
    Opened,
    Deleted,
    Reset,
}
