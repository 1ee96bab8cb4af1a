//! Provider gateway for switchboard.
//!
//! This crate provides:
//! - A provider registry with validation and cascading removal
//! - Credential management over the system keyring with env fallback
//! - An adapter layer that speaks each provider's wire dialect
//! - Model catalogs that tolerate slow and partial providers
//! - Quota tracking with fallback models
//! - Conversations bound to one provider model for their lifetime
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      Gateway                         │
//! │  ┌──────────────┐ ┌─────────────┐ ┌──────────────┐  │
//! │  │ Conversation │ │  Favorites  │ │    Health    │  │
//! │  │   Manager    │ │    Store    │ │   Checker    │  │
//! │  └──────┬───────┘ └──────┬──────┘ └──────┬───────┘  │
//! │         │  ┌───────────┐ │ ┌───────────┐ │          │
//! │         ├─▶│   Quota   │ └▶│  Catalog  │◀┤          │
//! │         │  │  Tracker  │   │  Service  │ │          │
//! │         │  └───────────┘   └─────┬─────┘ │          │
//! │         ▼                        ▼       ▼          │
//! │  ┌─────────────────────────────────────────────┐    │
//! │  │          AdapterLayer (HttpTransport)        │    │
//! │  └─────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────┐
//! │        ProviderRegistry    ·    CredentialStore      │
//! │                          (System Keyring + Env)     │
//! └─────────────────────────────────────────────────────┘
//! ```

mod error;
mod sync;
mod types;

pub mod adapter;
pub mod auth;
pub mod catalog;
pub mod conversation;
pub mod favorites;
pub mod gateway;
pub mod health;
pub mod quota;
pub mod registry;
pub mod store;

pub use adapter::{AdapterLayer, HttpTransport, MockTransport, ReqwestTransport};
pub use auth::{ApiKey, CredentialStore};
pub use catalog::{ModelCatalogService, PartialCatalog, RefreshOutcome};
pub use conversation::{Conversation, ConversationManager, ConversationState, Message, MessageRole};
pub use error::{Error, QuotaSource, Result};
pub use favorites::{FavoriteEntry, FavoritesStore};
pub use gateway::{Gateway, GatewaySettings};
pub use health::{HealthChecker, HealthResult};
pub use quota::{QuotaDecision, QuotaTracker};
pub use registry::{AuthScheme, Provider, ProviderConfig, ProviderRegistry, ProviderStatus};
pub use store::StateDir;
pub use types::{Availability, Model, ModelTarget, Tier};
