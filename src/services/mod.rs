//! Clients for the external intent and reply services

mod intent;
mod reply;
mod route;

pub use intent::{
    DialogueContext, HttpIntentService, IntentAction, IntentResponse, IntentService,
    ReminderKind, ReminderParams, ReplyOnlyIntentService,
};
pub use reply::{HttpReplyGenerator, ReplyGenerator, TextStream};
pub use route::Route;
