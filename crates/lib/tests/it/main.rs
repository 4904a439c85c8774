/*! Integration tests for Concord.
 *
 * This test suite is organized as a single integration test binary.
 * The module structure mirrors the main library structure:
 * - doc: Tests for the merge engine, history, and notifications
 * - set: Tests for the filtered Set views
 * - seq: Tests for the ordered Sequence views
 */

use tracing_subscriber::EnvFilter;

#[ctor::ctor]
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("concord=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

mod doc;
mod helpers;
mod seq;
