/// Domain-tagged logging macros.
///
/// Every macro adds a `domain` field naming the subsystem an event belongs
/// to: `sys` (lifecycle), `conn` (source and sink I/O), `pipe` (event and
/// window flow), `res` (metrics and resource snapshots), `conf`
/// (configuration).
///
/// ```ignore
/// tb_info!(sys, groups = 3, "engine started");
/// tb_warn!(conn, partition = p, error = %e, "partition read failed");
/// ```
///
/// The domain is a bare identifier, not a string.

#[doc(hidden)]
macro_rules! tb_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

macro_rules! tb_error {
    ($domain:ident, $($rest:tt)*) => {
        tb_log!(error, $domain, $($rest)*)
    };
}

macro_rules! tb_warn {
    ($domain:ident, $($rest:tt)*) => {
        tb_log!(warn, $domain, $($rest)*)
    };
}

macro_rules! tb_info {
    ($domain:ident, $($rest:tt)*) => {
        tb_log!(info, $domain, $($rest)*)
    };
}

macro_rules! tb_debug {
    ($domain:ident, $($rest:tt)*) => {
        tb_log!(debug, $domain, $($rest)*)
    };
}

macro_rules! tb_trace {
    ($domain:ident, $($rest:tt)*) => {
        tb_log!(trace, $domain, $($rest)*)
    };
}
