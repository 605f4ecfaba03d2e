//! Types shared by every xpsync crate: the event model, stream/category
//! identifiers, tunable constants and validation errors.

pub mod constants;
pub mod error;
pub mod event;
pub mod types;

pub use error::ValidationError;
pub use event::{Event, Payload};
pub use types::{Category, EventId, Stream, SubjectId};
