//! Chat sessions: streaming generation, reasoning handling and
//! persistence.
pub mod db;
mod manager;
pub use manager::{ChatEvent, GenerationHandle, GenerationManager, GenerationManagerBuilder};
pub mod models;
pub use models::{ChatMetadata, Message, NEW_CHAT_TITLE};
pub mod reasoning;
pub mod store;
pub use store::{MetadataUpdate, SessionStore};
mod submit;
pub use submit::{SubmitError, Submission, Submitter};
pub mod task;
pub use task::GenerationOutcome;
pub mod title;
pub use title::TitleGenerator;
