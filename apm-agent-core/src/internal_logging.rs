#![allow(unused_macros)]
///
/// **Note**: These macros (`apm_info!`, `apm_warn!`, `apm_debug!`, and `apm_error!`) report
/// anomalies detected inside the tracing core (malformed headers, lifecycle misuse, pool
/// pressure). They are not meant for application logging.
///
/// When running tests with `--nocapture`, these macros print their output to stdout.
///
/// Macro for logging informational messages.
///
/// # Fields:
/// - `name`: The operation or action being logged.
/// - Additional optional key-value pairs, formatted with `Display`.
///
/// # Example:
/// ```rust
/// use apm_agent_core::apm_info;
/// apm_info!(name: "Tracer.Start", max_spans = 500);
/// ```
#[macro_export]
macro_rules! apm_info {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_info: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::info!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = %$value),+);
        }

        #[cfg(test)]
        {
            print!("apm_info: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $(&$value),+);
        }
    };
}

/// Macro for logging warning messages.
///
/// Used for anomalies the tracer recovers from, e.g. a malformed incoming header.
///
/// # Fields:
/// - `name`: The operation or action being logged.
/// - Additional optional key-value pairs, formatted with `Display`.
///
/// # Example:
/// ```rust
/// use apm_agent_core::apm_warn;
/// apm_warn!(name: "TraceContext.InvalidHeader", header = "00-zz");
/// ```
#[macro_export]
macro_rules! apm_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_warn: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::warn!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = %$value),+);
        }

        #[cfg(test)]
        {
            print!("apm_warn: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $(&$value),+);
        }
    };
}

/// Macro for logging debug messages.
///
/// # Fields:
/// - `name`: The operation or action being logged.
/// - Additional optional key-value pairs, formatted with `Display`.
///
/// # Example:
/// ```rust
/// use apm_agent_core::apm_debug;
/// apm_debug!(name: "Tracer.EndSpan", span = "db query");
/// ```
#[macro_export]
macro_rules! apm_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_debug: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::debug!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = %$value),+);
        }

        #[cfg(test)]
        {
            print!("apm_debug: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $(&$value),+);
        }
    };
}

/// Macro for logging error messages.
///
/// # Fields:
/// - `name`: The operation or action being logged.
/// - Additional optional key-value pairs, formatted with `Display`.
///
/// # Example:
/// ```rust
/// use apm_agent_core::apm_error;
/// apm_error!(name: "ActiveStack.Overflow", max_depth = 516);
/// ```
#[macro_export]
macro_rules! apm_error {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name);
        }

        #[cfg(test)]
        {
            print!("apm_error: name={}\n", $name);
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            $crate::_private::error!(name: $name, target: env!("CARGO_PKG_NAME"), name = $name, $($key = %$value),+);
        }

        #[cfg(test)]
        {
            print!("apm_error: name={}", $name);
            $(
                print!(", {}={}", stringify!($key), $value);
            )+
            print!("\n");
        }

        #[cfg(all(not(feature = "internal-logs"), not(test)))]
        {
            let _ = ($name, $(&$value),+);
        }
    };
}

/// Logs a warning the first time a call site is reached and a debug message afterwards.
///
/// Used for lifecycle misuse that tends to repeat on every request once it happens.
#[macro_export]
macro_rules! apm_warn_once {
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {{
        static LOGGED: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);
        if !LOGGED.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            $crate::apm_warn!(name: $name, $($key = $value),+);
        } else {
            $crate::apm_debug!(name: $name, $($key = $value),+);
        }
    }};
}
