//! Distributed Bayesian best-subset regression for gene regulatory network
//! inference.
//!
//! Per response gene, a sparse linear model is fit over a restricted pool of
//! candidate regulators. The pool combines prior knowledge with a top-k
//! ranking of an information-theoretic relevance (CLR) matrix; the G
//! independent regressions are then fanned out across a pluggable execution
//! backend and reassembled in deterministic gene order.
//!
//! Entry point: [`engine::BbsrEngine::run_bootstrap`] with a controller from
//! [`controller`] and (optionally) a custom [`solver::Solver`].

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod controller;
pub mod engine;
pub mod pool;
pub mod solver;
pub mod task;
pub mod types;
pub mod weights;
