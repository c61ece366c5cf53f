//! Record store shared between the worker and the web layer.
//!
//! Job and Session rows are the only handoff channel: the web layer
//! creates jobs and reads job/session fields for display, the worker
//! claims and advances them. Relational backend selection lives outside
//! this crate; the store here persists everything as one JSON document.

mod json;
mod records;

pub use json::{JsonStore, NewLlmCall};
pub use records::{
    Campaign, Job, JobStatus, JobStep, LlmCall, Session, SessionStatus, StageEvent, Transcript,
};
