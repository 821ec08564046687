//! Durable session storage for SerialAgent (§4.D): a file-per-session JSONL
//! backend for `sa_domain::session::SessionStore`.

pub mod durable;

pub use durable::JsonlSessionStore;
