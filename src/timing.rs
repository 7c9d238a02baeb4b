//! Phase timing and counters. Each linker pass opens a tracing span; run with
//! `RUST_LOG=info` (or --stats for the counters) to see where the time goes.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[macro_export]
macro_rules! timing_phase {
    ($($args:tt)*) => {
        let _span = tracing::info_span!($($args)*).entered();
    };
}

pub(crate) fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// A named statistic. Counters are cheap enough to bump from worker threads and are printed at
/// the end of the link when --stats is given.
pub(crate) struct Counter {
    name: &'static str,
    value: AtomicU64,
}

static COUNTERS: Mutex<Vec<&'static Counter>> = Mutex::new(Vec::new());

impl Counter {
    pub(crate) fn new(name: &'static str) -> &'static Counter {
        let counter = Box::leak(Box::new(Counter {
            name,
            value: AtomicU64::new(0),
        }));
        COUNTERS.lock().unwrap().push(counter);
        counter
    }

    pub(crate) fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn inc(&self) {
        self.add(1);
    }
}

pub(crate) fn print_counters() {
    let counters = COUNTERS.lock().unwrap();
    for counter in counters.iter() {
        eprintln!("{:>12}  {}", counter.value.load(Ordering::Relaxed), counter.name);
    }
}
