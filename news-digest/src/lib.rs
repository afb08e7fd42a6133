pub mod types;
pub mod fetcher;
pub mod aggregator;
pub mod step;
pub mod state;
pub mod llm_adapter;
pub mod prompts;
pub mod subscribers;
pub mod digest;
pub mod welcome;
pub mod trigger;

pub use types::*;
pub use fetcher::FinnhubClient;
pub use aggregator::{FetchLimits, NewsAggregator};
pub use step::{InMemoryStepStore, StepExecutor, StepStore};
pub use state::SqliteStepStore;
pub use llm_adapter::{GeminiAdapter, GeminiConfig};
pub use subscribers::PgSubscriberDirectory;
pub use digest::DigestOrchestrator;
pub use welcome::WelcomeWorkflow;
pub use trigger::{Trigger, TriggerOutcome, WorkflowDispatcher};
