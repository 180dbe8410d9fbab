//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The proxy runs inside the tokio runtime, so production code
//! MUST NOT use blocking network clients or block on futures.
//!
//! **Required**: `reqwest::Client` (async), `tokio::net`, `.await`

use architectural_enforcement::{assert_clean, scan};

#[test]
fn test_no_blocking_http_client() {
    let violations = scan(|code| code.contains("reqwest::blocking"));
    assert_clean("No reqwest::blocking in production code", &violations);
}

#[test]
fn test_no_blocking_network_io() {
    let violations = scan(|code| code.contains("std::net::"));
    assert_clean("No std::net in production code; use tokio::net", &violations);
}

#[test]
fn test_no_block_on_inside_runtime() {
    let violations = scan(|code| code.contains("block_on(") || code.contains("block_in_place("));
    assert_clean("No block_on/block_in_place in production code", &violations);
}
