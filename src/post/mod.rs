//! Post-processing fan-out: webhook posting and campaign scripts.

mod scripts;
mod webhook;

pub use scripts::{ScriptOutcome, ScriptRunner, ScriptStatus};
pub use webhook::{
    hard_slice, split_paragraphs, PostError, WebhookPoster, MESSAGE_LIMIT,
};
