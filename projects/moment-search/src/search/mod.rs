pub mod engine;
pub mod query;
pub mod session;
pub mod types;

pub use engine::{MatchEngine, Matches, Reporter};
pub use query::QueryEncoder;
pub use session::{SearchHandle, SearchSession};
pub use types::{
    format_ms, MatchRecord, ProgressEvent, QueryInput, QueryRepresentation, SearchEvent,
    SearchMode, SearchOutcome, SearchRequest, StatusMessage,
};
