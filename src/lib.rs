//! Browser-driven research against an answer-engine chat page, exposed as
//! tools over stdio JSON-RPC and HTTP, plus a client for the batch parsing API.

pub mod api;
pub mod chrome;
pub mod config;
pub mod dom;
pub mod error;
pub mod extractor;
pub mod mcp;
pub mod navigator;
pub mod page;
pub mod parse_client;
pub mod poller;
pub mod research;
pub mod selectors;
pub mod session;
pub mod stealth;
pub mod submitter;
pub mod tools;

#[cfg(test)]
pub mod testing;

pub use error::AgentError;
pub use research::{QueryMode, QueryRequest, ResearchOutput, Researcher};
