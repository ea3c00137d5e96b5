//! Parley wire protocol and shared conversation model.
//!
//! Pure data types shared between the hub server and its clients:
//! the message/participant model and the closed client/server frame
//! enums exchanged over the WebSocket. No I/O lives here.

pub mod frame;
pub mod model;

pub use frame::{ClientFrame, ErrorCode, ServerFrame};
pub use model::{
    ConnectionState, ConversationId, ConversationMode, Message, MessageStatus, ParticipantId,
    ParticipantInfo, ParticipantKind,
};
