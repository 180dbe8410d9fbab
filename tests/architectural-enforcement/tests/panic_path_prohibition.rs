//! Integration Test: Panic Path Prohibition
//!
//! **Policy**: Production code propagates errors with `?` or turns them into
//! replies and stream events. `unwrap()` and `expect()` are for tests only.

use architectural_enforcement::{assert_clean, scan};

#[test]
fn test_no_unwrap_or_expect_in_production_code() {
    let violations = scan(|code| code.contains(".unwrap()") || code.contains(".expect("));
    assert_clean("No unwrap()/expect() in production code", &violations);
}

#[test]
fn test_no_panic_macros_in_production_code() {
    let violations = scan(|code| {
        code.contains("panic!(") || code.contains("todo!(") || code.contains("unimplemented!(")
    });
    assert_clean("No panic!/todo!/unimplemented! in production code", &violations);
}
