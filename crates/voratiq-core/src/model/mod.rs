//! Session domain model (§3).

pub mod agent;
pub mod ids;
pub mod session;

pub use agent::{AgentDefinition, VendorProvider, MODEL_PLACEHOLDER};
pub use ids::{AgentId, CandidateAlias, EvalSlug, IdError, ReviewId, RunId, SessionId, SpecId};
pub use session::{
    AgentInvocationRecord, ApplyOutcome, ApplyStatus, ArtifactCapture, ChatFormat, EvalOutcome,
    EvalStatus, InvocationStatus, ReviewRecord, ReviewerInvocationRecord, RunRecord, SessionKind,
    SessionRecord, SessionStatus, SpecIteration, SpecRecord,
};
