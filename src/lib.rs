//! `PromptStrike` - Template-driven adversarial testing engine for LLM
//! endpoints
//!
//! This library probes a target LLM endpoint with a catalog of
//! adversarial prompt templates, classifies each response through a
//! detection pipeline, and records structured results for reporting
//! and for an adaptive selector that learns which attacks land where.
//!
//! The usual composition:
//!
//! ```no_run
//! use std::sync::Arc;
//! use promptstrike::campaign::{CampaignController, CampaignSpec, TargetSpec};
//! use promptstrike::config::EngineConfig;
//! use promptstrike::provider::{ProviderRegistry, ScriptedAdapter};
//! use promptstrike::template::{CatalogLoader, CatalogSource, LoaderOptions, TemplateStore};
//!
//! # async fn run() -> promptstrike::Result<()> {
//! let loader = CatalogLoader::new(LoaderOptions::default());
//! let (snapshot, _report) =
//!     loader.load(&[CatalogSource::Dir("catalog".into())])?;
//! let templates = Arc::new(TemplateStore::new(snapshot));
//!
//! let config = EngineConfig::default();
//! let providers = Arc::new(ProviderRegistry::new(&config));
//! providers.register(Arc::new(ScriptedAdapter::always("stub", "no")));
//!
//! let controller = CampaignController::new(config, templates, providers);
//! let campaign_id = controller
//!     .start(CampaignSpec {
//!         targets: vec![TargetSpec {
//!             provider: "stub".into(),
//!             models: vec!["stub-model".into()],
//!             credential: None,
//!             requests_per_minute: None,
//!             tokens_per_minute: None,
//!         }],
//!         ..CampaignSpec::default()
//!     })
//!     .await?;
//! let status = controller.status(campaign_id)?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod campaign;
pub mod config;
pub mod detection;
pub mod error;
pub mod executor;
pub mod governor;
pub mod observability;
pub mod probe;
pub mod provider;
pub mod queue;
pub mod selector;
pub mod store;
pub mod template;

pub use error::{Error, Result};
pub use probe::{ProbeJob, ProbeResult, Verdict};
