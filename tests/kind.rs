//! End-to-end integration tests for the shoal controller
//!
//! These tests require a Kubernetes cluster to run. They are ignored by default
//! and can be run with:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```
//!
//! The current kubeconfig context is used; a kind cluster works well. The
//! controller runs in-process against that cluster for the duration of each
//! test.

mod kind_tests;
