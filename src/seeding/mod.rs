//! Seeding session model: events, progress reconciliation, collaborators.

pub mod collaborators;
pub mod consumer;
pub mod events;
pub mod reconciler;

pub use collaborators::{
    database_name, AutoAccept, DsnResolver, EnvDsnResolver, EnvTokenProvider, HumanAnswer,
    HumanResponder, ProgressSink, StaticDsnResolver, StaticTokenProvider, TokenProvider,
    TracingProgressSink,
};
pub use consumer::EventConsumer;
pub use events::{AskHuman, Event, PlanPayload};
pub use reconciler::{
    Applied, ProgressReconciler, ProgressSnapshot, SeedOutcome, SessionPhase, Termination,
};
