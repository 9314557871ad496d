//! Client core for the LISA study assistant.
//!
//! ARCHITECTURE
//! ============
//! Two cooperating parts share one [`session::SessionContext`]:
//!
//! - [`session::SessionKeeper`] watches user activity and renews the access
//!   credential shortly before it lapses.
//! - [`chat::ConversationController`] owns the transcript of the selected
//!   chatbot: history load, send/receive, explanation requests, clearing.
//!
//! Both reach the backend through [`net::HttpApi`], which reads the
//! credential at call time and recovers once from a 401.

pub mod chat;
pub mod clock;
pub mod config;
pub mod net;
pub mod session;
