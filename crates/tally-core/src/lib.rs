mod store;
mod error;
mod events;
mod dispatcher;
mod poller;
#[cfg(test)]
mod tests;

pub use store::{ConversationStore, Snapshot};
pub use error::{HistoryError, JobError, StoreError, SubmitError, TurnFailure};
pub use events::{Rollback, TurnEvent, TurnObserver, TurnOutcome};
pub use dispatcher::{DispatchOptions, QueryDispatcher, TurnContext, TurnState};
pub use poller::{JobOutcome, JobPoller, JobProgress, PollPolicy, Sleeper, TokioSleeper};
