pub(crate) use anyhow::Context as _;
pub use anyhow::Error;
use std::fmt::Display;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Diagnostics from worker threads go through a single mutex so that messages from concurrent
/// passes don't interleave mid-line.
static STDERR_LOCK: Mutex<()> = Mutex::new(());

/// Set by `error` and, with --fatal-warnings, by `warning`. Checked at pass boundaries via
/// `checkpoint`.
pub(crate) static HAS_ERROR: AtomicBool = AtomicBool::new(false);

pub fn report_error_and_exit(error: &Error) -> ! {
    {
        let _guard = STDERR_LOCK.lock();
        eprintln!("mold: {error:#}");
    }
    crate::output_file::remove_temporary_output();
    std::process::exit(1);
}

/// Reports a recoverable link error. Processing continues until the next `checkpoint`.
pub(crate) fn error(message: impl Display) {
    {
        let _guard = STDERR_LOCK.lock();
        eprintln!("mold: {message}");
    }
    HAS_ERROR.store(true, Ordering::Relaxed);
}

pub(crate) fn warning(message: impl Display, fatal_warnings: bool) {
    {
        let _guard = STDERR_LOCK.lock();
        eprintln!("mold: warning: {message}");
    }
    if fatal_warnings {
        HAS_ERROR.store(true, Ordering::Relaxed);
    }
}

/// Prints a trace-symbol diagnostic.
pub(crate) fn trace(message: impl Display) {
    let _guard = STDERR_LOCK.lock();
    println!("trace-symbol: {message}");
}

/// Synchronized plain stdout line, for --print-gc-sections and friends.
pub(crate) fn println_sync(message: impl Display) {
    let _guard = STDERR_LOCK.lock();
    println!("{message}");
}

/// Aborts the link if any pass since the previous checkpoint reported an error.
pub(crate) fn checkpoint() -> Result {
    if HAS_ERROR.load(Ordering::Relaxed) {
        anyhow::bail!("link failed due to previous errors");
    }
    Ok(())
}

/// Like debug_assert, but bails instead of panicking so that the message can carry context about
/// which file or symbol was being processed.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}
