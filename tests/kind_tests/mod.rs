//! Integration tests for the shoal controller
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how users interact with SearchCluster resources in real-world
//! scenarios.
//!
//! # Test Organization
//!
//! - `search_cluster_lifecycle`: Stories about creating a SearchCluster and
//!   watching the controller build, repair and tear down what it owns
//!
//! # Running These Tests
//!
//! These tests are ignored by default because they require a cluster:
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod helpers;
mod search_cluster_lifecycle;
