use std::fmt;

/// Logs an error and aborts the process. Used when the scheduler's own bookkeeping is found to be inconsistent, since no thread can
/// safely continue running at that point.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::util::abort(format_args!($($arg)*))
    };
}

pub(crate) use fatal;

#[cold]
pub(crate) fn abort(args: fmt::Arguments) -> ! {
    log::error!("{}", args);
    eprintln!("uthread: fatal error: {}", args);
    std::process::abort()
}
