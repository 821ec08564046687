//! Thin CLI demonstrator for `sa-core`'s middleware chain: builds one
//! `Agent` + `LlmRouter` + session store from config, then drives a single
//! `Evaluator::evaluate` call for a caller-supplied prompt.

pub mod cli;
pub mod demo;
pub mod event_log;
