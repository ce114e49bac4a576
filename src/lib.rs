//! Milestone-driven shipment tracking over a real browser.
//!
//! A [`service::TrackingService`] runs one [`orchestrator::Orchestrator`] per
//! booking. The orchestrator walks the [`milestone::Milestone`] template,
//! replaying cached action scripts where it can and otherwise consulting the
//! oracles in [`oracle`] to plan, look at the page and generate sandboxed
//! [`instruction`] scripts that the [`executor`] runs through a
//! [`browser::BrowserDriver`].

pub mod browser;
pub mod cache;
pub mod capture;
pub mod config;
pub mod context;
pub mod dom;
pub mod evaluator;
pub mod executor;
pub mod instruction;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod milestone;
pub mod oracle;
pub mod orchestrator;
pub mod recorder;
pub mod runtime;
pub mod server;
pub mod service;
pub mod tabs;

#[cfg(test)]
mod testing;
