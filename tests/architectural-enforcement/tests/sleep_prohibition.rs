//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Idle timeouts use
//! `tokio::time::timeout` around the next read, stops use a cancellation
//! token, and the single-flight refresh is awaited, never polled.
//!
//! **Exceptions**: test code (`#[cfg(test)]` modules and `tests/` directories)

use architectural_enforcement::{assert_clean, scan};

#[test]
fn test_no_sleep_in_production_code() {
    let violations = scan(|code| code.contains("::sleep(") || code.contains(".sleep("));
    assert_clean("No sleep in production code; wait on I/O, channels or tokens", &violations);
}

#[test]
fn test_no_interval_polling_in_production_code() {
    // Session state is pushed through channels; nothing polls on a timer.
    let violations = scan(|code| code.contains("time::interval("));
    assert_clean("No interval polling in production code", &violations);
}
