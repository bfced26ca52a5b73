//! Signed blog posts and comments.
//!
//! ```text
//! signed  = [group_id, timestamp, content...]
//! body    = [type, content..., signature]
//! ```
//!
//! Length ceilings are checked before anything is signed.

use std::sync::Arc;

use crate::bdf_list;
use crate::core::{
    Clock, EncodeError, GroupId, MessageId, MAX_COMMENT_TEXT_LENGTH, MAX_POST_TEXT_LENGTH,
};

use super::{Author, LocalAuthor, Message, MessageFactory};

/// Signature label for posts.
pub const POST_SIGNING_LABEL: &str = "thicket/blog/post";

/// Signature label for comments.
pub const COMMENT_SIGNING_LABEL: &str = "thicket/blog/comment";

/// Body type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MessageType {
    /// A top-level post.
    Post = 0,
    /// A comment on a post.
    Comment = 1,
}

impl MessageType {
    pub(crate) fn from_long(value: i64) -> Option<Self> {
        match value {
            0 => Some(MessageType::Post),
            1 => Some(MessageType::Comment),
            _ => None,
        }
    }
}

/// An encoded post.
#[derive(Debug, Clone)]
pub struct Post {
    /// The signed message.
    pub message: Message,
    /// The post this one replies to, if any.
    pub parent: Option<MessageId>,
    /// Who wrote it.
    pub author: Author,
}

/// An encoded comment.
#[derive(Debug, Clone)]
pub struct Comment {
    /// The signed message.
    pub message: Message,
    /// The post that started the thread.
    pub parent_original: MessageId,
    /// The message being commented on directly.
    pub parent_current: MessageId,
    /// Who wrote it.
    pub author: Author,
}

/// Encodes and signs application messages.
pub struct MessageEncoder {
    clock: Arc<dyn Clock>,
    factory: MessageFactory,
}

impl MessageEncoder {
    /// Create an encoder stamping comments with `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            factory: MessageFactory,
        }
    }

    /// Encode and sign a post.
    pub fn encode_post(
        &self,
        group_id: GroupId,
        timestamp: u64,
        parent: Option<MessageId>,
        author: &LocalAuthor,
        text: &str,
    ) -> Result<Post, EncodeError> {
        check_length("post text", text, MAX_POST_TEXT_LENGTH)?;

        let signed = post_preimage(&group_id, timestamp, text);
        let signature = author.keypair().sign(POST_SIGNING_LABEL, &signed);

        let body = bdf_list![MessageType::Post as i64, text, &signature[..]].to_bytes();
        let message = self.factory.create_message(group_id, timestamp, body)?;
        Ok(Post {
            message,
            parent,
            author: author.author().clone(),
        })
    }

    /// Encode and sign a comment, stamped with the current time.
    ///
    /// `comment` may be absent (a bare reblog) but never empty.
    pub fn encode_comment(
        &self,
        group_id: GroupId,
        author: &LocalAuthor,
        comment: Option<&str>,
        parent_original: MessageId,
        parent_current: MessageId,
    ) -> Result<Comment, EncodeError> {
        if let Some(text) = comment {
            if text.is_empty() {
                return Err(EncodeError::Empty("comment"));
            }
            check_length("comment", text, MAX_COMMENT_TEXT_LENGTH)?;
        }

        let timestamp = self.clock.now_millis();
        let signed =
            comment_preimage(&group_id, timestamp, comment, &parent_original, &parent_current);
        let signature = author.keypair().sign(COMMENT_SIGNING_LABEL, &signed);

        let body = bdf_list![
            MessageType::Comment as i64,
            comment,
            &parent_original.as_bytes()[..],
            &parent_current.as_bytes()[..],
            &signature[..],
        ]
        .to_bytes();
        let message = self.factory.create_message(group_id, timestamp, body)?;
        Ok(Comment {
            message,
            parent_original,
            parent_current,
            author: author.author().clone(),
        })
    }
}

fn check_length(field: &'static str, text: &str, max: usize) -> Result<(), EncodeError> {
    if text.len() > max {
        return Err(EncodeError::TooLong {
            field,
            len: text.len(),
            max,
        });
    }
    Ok(())
}

pub(crate) fn post_preimage(group_id: &GroupId, timestamp: u64, text: &str) -> Vec<u8> {
    bdf_list![&group_id.as_bytes()[..], timestamp as i64, text].to_bytes()
}

pub(crate) fn comment_preimage(
    group_id: &GroupId,
    timestamp: u64,
    comment: Option<&str>,
    parent_original: &MessageId,
    parent_current: &MessageId,
) -> Vec<u8> {
    bdf_list![
        &group_id.as_bytes()[..],
        timestamp as i64,
        comment,
        &parent_original.as_bytes()[..],
        &parent_current.as_bytes()[..],
    ]
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, HASH_SIZE};
    use crate::message::{message_id, AuthorFactory, BdfList};

    fn encoder() -> MessageEncoder {
        MessageEncoder::new(Arc::new(ManualClock::new(1_700_000_000_000)))
    }

    fn group() -> GroupId {
        GroupId::from_bytes([9; HASH_SIZE])
    }

    #[test]
    fn test_post_id_is_hash_of_encoding() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder()
            .encode_post(group(), 1234, None, &author, "first post")
            .unwrap();
        let m = &post.message;
        assert_eq!(m.id(), message_id(&group(), 1234, m.body()));
        assert_eq!(Message::from_raw(&m.raw()).unwrap().id(), m.id());
        assert_eq!(post.author.id(), author.author().id());
    }

    #[test]
    fn test_changed_signature_changes_id() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder()
            .encode_post(group(), 1234, None, &author, "text")
            .unwrap();
        let mut body = post.message.body().to_vec();
        let last = body.len() - 2;
        body[last] ^= 0x01;
        assert_ne!(message_id(&group(), 1234, &body), post.message.id());
    }

    #[test]
    fn test_post_body_layout() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder()
            .encode_post(group(), 1234, None, &author, "text")
            .unwrap();
        let body = BdfList::from_bytes(post.message.body()).unwrap();
        assert_eq!(body.get_long(0).unwrap(), MessageType::Post as i64);
        assert_eq!(body.get_string(1).unwrap(), "text");
        assert_eq!(body.get_raw(2).unwrap().len(), 64);
    }

    #[test]
    fn test_oversized_post_rejected() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let text = "x".repeat(MAX_POST_TEXT_LENGTH + 1);
        let err = encoder()
            .encode_post(group(), 1, None, &author, &text)
            .unwrap_err();
        assert!(matches!(err, EncodeError::TooLong { field: "post text", .. }));

        let text = "x".repeat(MAX_POST_TEXT_LENGTH);
        assert!(encoder().encode_post(group(), 1, None, &author, &text).is_ok());
    }

    #[test]
    fn test_comment_limits() {
        let author = AuthorFactory.create_local_author("bob").unwrap();
        let parent = MessageId::from_bytes([1; HASH_SIZE]);
        let e = encoder();

        assert!(matches!(
            e.encode_comment(group(), &author, Some(""), parent, parent),
            Err(EncodeError::Empty(_))
        ));
        let long = "y".repeat(MAX_COMMENT_TEXT_LENGTH + 1);
        assert!(matches!(
            e.encode_comment(group(), &author, Some(&long), parent, parent),
            Err(EncodeError::TooLong { .. })
        ));
        let c = e.encode_comment(group(), &author, None, parent, parent).unwrap();
        assert_eq!(c.message.timestamp(), 1_700_000_000_000);
        let body = BdfList::from_bytes(c.message.body()).unwrap();
        assert_eq!(body.get_optional_string(1).unwrap(), None);
    }
}
