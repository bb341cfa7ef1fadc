/// Builds an `http_types::Error` carrying the given status code.
macro_rules! format_err_status {
    ($status:expr, $msg:literal $(,)?) => {
        http_types::Error::from_str($status, $msg)
    };
    ($status:expr, $fmt:literal, $($arg:tt)+) => {
        http_types::Error::from_str($status, format!($fmt, $($arg)+))
    };
}

/// Returns early with an `http_types::Error` carrying the given status code.
macro_rules! bail_status {
    ($status:expr, $($arg:tt)+) => {
        return Err(format_err_status!($status, $($arg)+))
    };
}

/// Returns early with an error if the condition is false.
macro_rules! ensure_status {
    ($cond:expr, $status:expr, $($arg:tt)+) => {
        if !$cond {
            bail_status!($status, $($arg)+);
        }
    };
}
