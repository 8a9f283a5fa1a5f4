pub mod llm_worker;
pub mod summary_worker;
pub use llm_worker::LLMWorker;
pub use summary_worker::{SummaryJobOutcome, SummaryWorker};
