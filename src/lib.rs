//! napier library: config document, tool registry and lifecycle, LLM backend client,
//! control plane, HTTP control API, interactive session.

pub mod backend;
pub mod config;
pub mod control;
pub mod llm;
pub mod menu;
pub mod server;
pub mod tools;
