//! Conversation layer: transcript model, reply normalization, the thinking
//! indicator, and the controller that ties them to the backend.

pub mod controller;
pub mod endpoint;
pub mod message;
pub mod thinking;
pub mod transcript;

pub use controller::{
    ChatView, ClearOutcome, ConversationController, LoadOutcome, LogNotifier, NoopSpeaker, Notice, NoticeKind,
    Notifier, Phase, RejectReason, SendOutcome, Speaker,
};
pub use endpoint::ConversationEndpoint;
pub use message::{BotReply, Message, Sender, Source};
pub use thinking::{ThinkingFrame, ThinkingLease};
pub use transcript::Transcript;
