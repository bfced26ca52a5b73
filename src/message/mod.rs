//! Message encoding
//!
//! Content-addressed messages and signed application payloads:
//!
//! - **Bdf**: canonical typed list encoding used for every signed preimage
//! - **Message**: id = hash of group, timestamp and body
//! - **Author**: id = hash of format version, name and public key
//! - **Encoder / Validator**: signed posts and comments

mod author;
mod bdf;
mod encoder;
#[allow(clippy::module_inception)]
mod message;
mod validator;

pub use author::{author_id, Author, AuthorFactory, LocalAuthor};
pub use bdf::{BdfList, BdfValue};
pub use encoder::{
    Comment, MessageEncoder, MessageType, Post, COMMENT_SIGNING_LABEL, POST_SIGNING_LABEL,
};
pub use message::{message_id, Message, MessageFactory, MESSAGE_HEADER_LENGTH};
pub use validator::{CommentContent, MessageValidator, PostContent};
