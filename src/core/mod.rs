//! Core conversation engine
//!
//! Persistence, conversation management, reply assembly and the session
//! controller that ties them to a model provider.

mod assembler;
mod service;
mod session;
mod store;

pub use assembler::AssemblySink;
pub use session::{ConversationListing, SessionController, SessionError};
pub use store::{RecordStore, StoreError};
