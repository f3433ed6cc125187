/// State management module
///
/// This module handles all application state, including:
/// - Key-value storage, durable and per-session (store.rs)
/// - Shared data structures (data.rs)
/// - The badge collection and numbering cursor (ledger.rs)
/// - The scan permission flag (session.rs)
/// - The scan -> register -> capture -> badge state machine (flow.rs)

pub mod data;
pub mod flow;
pub mod ledger;
pub mod session;
pub mod store;
