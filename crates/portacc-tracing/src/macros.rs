//! Instrumentation macros used at queue, copy and launch sites.
//!
//! All of them are silent when [`crate::performance::performance_enabled`]
//! is false, apart from the timing of `timed_block!` which is always returned.

/// Open a [`PerformanceSpan`](crate::performance::PerformanceSpan) and tag it
/// with launch or copy parameters.
///
/// ```rust
/// use portacc_tracing::perf_span;
///
/// let _span = perf_span!("memset_3d", bytes = 4096, depth = 4);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr $(,)?) => {
        $crate::performance::PerformanceSpan::new($name, None)
    };
    ($name:expr, $($key:ident = $val:expr),+ $(,)?) => {{
        let perf = $crate::performance::PerformanceSpan::new($name, None);
        if $crate::performance::performance_enabled() {
            let _entered = perf.enter();
            ::tracing::debug!($($key = $val,)+ "span parameters");
        }
        perf
    }};
}

/// One-off debug event named `$name`.
///
/// ```rust
/// portacc_tracing::perf_event!("queue_drained", tasks = 12, device = "cpu");
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($key:ident = $val:expr),+ $(,)?) => {
        if $crate::performance::performance_enabled() {
            ::tracing::debug!(event = $name, $($key = $val),+);
        }
    };
}

/// Evaluate `$body` and return it with its wall time in microseconds.
///
/// ```rust
/// let (sum, _us) = portacc_tracing::timed_block!("sum", { (1..=100).sum::<i32>() });
/// assert_eq!(sum, 5050);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $body:block) => {{
        let started = ::std::time::Instant::now();
        let value = $body;
        let micros = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        if $crate::performance::performance_enabled() {
            ::tracing::debug!(operation = $name, duration_us = micros, "block timed");
        }
        (value, micros)
    }};
}
