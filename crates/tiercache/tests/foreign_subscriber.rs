//! Runs in its own process: installs a global subscriber before tiercache
//! tries to.

use tiercache::observability::{apply_logging_level, init_tracing};

#[test]
fn test_level_changes_refused_under_foreign_subscriber() {
    tracing_subscriber::fmt().with_test_writer().init();

    init_tracing();

    assert!(!apply_logging_level("debug").unwrap());
    assert!(apply_logging_level("tiercache=verbose").is_err());
}
