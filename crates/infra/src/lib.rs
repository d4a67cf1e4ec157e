//! Infrastructure layer: persistence, dispatch, and external interfaces.

pub mod dispatcher;
pub mod factory;
pub mod mail;
pub mod progress;
pub mod rate_limiter;
pub mod repository;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use factory::{
    CampaignMessage, CreatedJobs, FactoryError, ImmediateJobsRequest, JobFactory, ScheduledJobs,
    ScheduledJobsRequest,
};
pub use mail::{
    InMemoryMailSender, LoggingMailSender, MailSender, OutgoingEmail, SendReceipt, TransportError,
};
pub use progress::ProgressTracker;
pub use rate_limiter::RateLimiter;
pub use repository::{
    CampaignRepository, CampaignSendConfig, InMemoryCampaignRepository,
    InMemoryRecipientRepository, RecipientOutcome, RecipientRepository, RepositoryError,
};
pub use store::in_memory::InMemoryStore;
pub use store::postgres::PostgresStore;
pub use store::{
    CampaignJobStats, FailedJobsQuery, JobEvent, JobEventKind, JobStore, JobStoreError,
    RateLimitStore, StatusUpdate,
};
