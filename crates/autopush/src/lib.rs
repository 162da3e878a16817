pub mod auth;
pub mod commit;
pub mod diff;
pub mod engine;
pub mod error;
pub mod git;
pub mod loader;
pub mod plan;
pub mod resource;
pub mod result;
pub mod scheduler;
pub mod secrets;
pub mod setters;
pub mod signing;
pub mod template;

pub use auth::{AuthOptions, CredentialResolver, TokenCache, TransportKind};
pub use commit::CommitPushEngine;
pub use diff::{Change, ObjectIdentifier, StructuredDiff, UpdateResult};
pub use engine::{CycleHint, CycleOutcome, SyncEngine};
pub use error::{ErrorCategory, Result, SyncError};
pub use git::{CheckedOutCommit, CheckoutStrategy, CloneOptions, WorkingCopy};
pub use loader::{ConfigLoader, LoadedConfig};
pub use plan::{PlanResolver, PlanView, ResolvedPlan};
pub use resource::{
    GitRepository, ImagePolicy, ImageUpdateAutomation, ObjectKey, SettingsSpec,
};
pub use result::PushResult;
pub use scheduler::{CycleReport, PassSummary, Scheduler};
pub use secrets::{DirectorySecretStore, InMemorySecretStore, Secret, SecretError, SecretStore};
pub use setters::{Patcher, SetterPatcher};
pub use signing::SigningEntity;
pub use template::{DefaultRenderer, MessageRenderer, TemplateData};
