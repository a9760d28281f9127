//! # Siteprobe
//!
//! Site analysis driven by a remote LLM agent.
//!
//! A single persistent connection to an automation gateway carries many
//! concurrent agent runs. Each target gets a prompt, the agent's free-form
//! reply is mined for its JSON answer, weak answers get one narrower retry,
//! and finished records go to a sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      TaskOrchestrator                          │
//! │   normalize → prompt → invoke → extract → parse → retry/merge  │
//! └───────────────┬───────────────────────────────────┬────────────┘
//!                 │ bounded by Semaphore              │ results
//!                 ▼                                   ▼
//!         ┌───────────────┐                    ┌─────────────┐
//!         │ AgentInvoker  │                    │ ResultSink  │
//!         └───┬───────▲───┘                    └─────────────┘
//!   chat.send │       │ chat / agent events
//!             ▼       │
//!   ┌──────────────────────────────┐      ┌──────────────┐
//!   │         GatewayLink          │─────▶│ EventRouter  │
//!   │ pending table · receive loop │      └──────────────┘
//!   └──────────────┬───────────────┘
//!                  │ Connector (WebSocket / in-memory)
//!                  ▼
//!               gateway
//! ```
//!
//! ## Key Concepts
//!
//! - **Run**: one remote agent execution, identified by a run id
//! - **Session key**: conversation identifier isolating concurrent runs
//! - **Weak result**: no extracted entries plus a block or an error; retried once
//! - **Structured answer**: the JSON object embedded in a free-form reply

pub mod analyzer;
pub mod config;
pub mod error;
pub mod extract;
pub mod invoker;
pub mod link;
pub mod orchestrator;
pub mod prompt;
pub mod protocol;
pub mod retry;
pub mod router;
pub mod sink;
pub mod site;
pub mod target;
pub mod transport;
pub mod venue;

pub use analyzer::{HeuristicAnalyzer, PageAnalyzer, PageReport, PatternHints};
pub use config::Config;
pub use error::ProbeError;
pub use invoker::{AgentBackend, AgentInvoker, AgentReply, RunFailure, RunOutcome, TextSource};
pub use link::{GatewayLink, LinkState};
pub use orchestrator::{AnalysisTask, TaskOrchestrator};
pub use router::{EventRouter, SubscriptionId};
pub use sink::{Exportable, FileSink, ResultSink};
pub use site::{PaginationType, SiteAnalysis, SiteTask};
pub use target::{SecurityIssue, Target};
pub use transport::{Connector, MemoryConnector, WsConnector};
pub use venue::{EventItem, VenueResult, VenueTask};
