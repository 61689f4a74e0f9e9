//! Tracing setup for the `evh` binary.
//!
//! Logs go to stderr so command output on stdout stays pipeable. The filter
//! comes from `RUST_LOG` when set, otherwise from `--verbose`.

use tracing_subscriber::EnvFilter;

const CRATE_TARGET: &str = env!("CARGO_CRATE_NAME");

fn default_directive(verbose: u8) -> String {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    format!("warn,{}={}", CRATE_TARGET, level)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(0), "warn,evidence_harness=warn");
        assert_eq!(default_directive(2), "warn,evidence_harness=debug");
        assert_eq!(default_directive(9), "warn,evidence_harness=trace");
    }
}
