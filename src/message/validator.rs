//! Signature and format checks for received posts and comments.

use crate::core::{
    EncodeError, MessageId, HASH_SIZE, MAX_COMMENT_TEXT_LENGTH, MAX_POST_TEXT_LENGTH,
};
use crate::crypto::signature;

use super::encoder::{comment_preimage, post_preimage, MessageType};
use super::encoder::{COMMENT_SIGNING_LABEL, POST_SIGNING_LABEL};
use super::{Author, BdfList, Message};

/// Validated post content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostContent {
    /// Post text.
    pub text: String,
}

/// Validated comment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentContent {
    /// Comment text, if any.
    pub comment: Option<String>,
    /// The post that started the thread.
    pub parent_original: MessageId,
    /// The message commented on.
    pub parent_current: MessageId,
}

/// Checks received messages against their claimed author.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    /// Parse a post body and verify its signature.
    pub fn validate_post(&self, message: &Message, author: &Author) -> Result<PostContent, EncodeError> {
        let body = BdfList::from_bytes(message.body())?;
        expect_type(&body, MessageType::Post, 3)?;
        let text = body.get_string(1)?;
        if text.len() > MAX_POST_TEXT_LENGTH {
            return Err(EncodeError::TooLong {
                field: "post text",
                len: text.len(),
                max: MAX_POST_TEXT_LENGTH,
            });
        }
        let signed = post_preimage(&message.group_id(), message.timestamp(), text);
        signature::verify(author.public_key(), POST_SIGNING_LABEL, &signed, body.get_raw(2)?)?;
        Ok(PostContent {
            text: text.to_owned(),
        })
    }

    /// Parse a comment body and verify its signature.
    pub fn validate_comment(
        &self,
        message: &Message,
        author: &Author,
    ) -> Result<CommentContent, EncodeError> {
        let body = BdfList::from_bytes(message.body())?;
        expect_type(&body, MessageType::Comment, 5)?;
        let comment = body.get_optional_string(1)?;
        match comment {
            Some("") => return Err(EncodeError::Empty("comment")),
            Some(c) if c.len() > MAX_COMMENT_TEXT_LENGTH => {
                return Err(EncodeError::TooLong {
                    field: "comment",
                    len: c.len(),
                    max: MAX_COMMENT_TEXT_LENGTH,
                });
            }
            _ => {}
        }
        let parent_original = message_id_at(&body, 2)?;
        let parent_current = message_id_at(&body, 3)?;
        let signed = comment_preimage(
            &message.group_id(),
            message.timestamp(),
            comment,
            &parent_original,
            &parent_current,
        );
        signature::verify(author.public_key(), COMMENT_SIGNING_LABEL, &signed, body.get_raw(4)?)?;
        Ok(CommentContent {
            comment: comment.map(str::to_owned),
            parent_original,
            parent_current,
        })
    }
}

fn expect_type(body: &BdfList, expected: MessageType, len: usize) -> Result<(), EncodeError> {
    if body.len() != len {
        return Err(EncodeError::Format(format!("expected {len} elements, got {}", body.len())));
    }
    match MessageType::from_long(body.get_long(0)?) {
        Some(t) if t == expected => Ok(()),
        other => Err(EncodeError::Format(format!("expected {expected:?}, got {other:?}"))),
    }
}

fn message_id_at(body: &BdfList, index: usize) -> Result<MessageId, EncodeError> {
    let raw: [u8; HASH_SIZE] = body
        .get_raw(index)?
        .try_into()
        .map_err(|_| EncodeError::Format(format!("element {index} is not a message id")))?;
    Ok(MessageId::from_bytes(raw))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{CryptoError, GroupId, ManualClock};
    use crate::message::{AuthorFactory, MessageEncoder, MessageFactory};

    fn encoder() -> MessageEncoder {
        MessageEncoder::new(Arc::new(ManualClock::new(5_000)))
    }

    fn group() -> GroupId {
        GroupId::from_bytes([2; HASH_SIZE])
    }

    #[test]
    fn test_valid_post() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder()
            .encode_post(group(), 77, None, &author, "hi there")
            .unwrap();
        let content = MessageValidator
            .validate_post(&post.message, author.author())
            .unwrap();
        assert_eq!(content.text, "hi there");
    }

    #[test]
    fn test_post_from_other_author_rejected() {
        let alice = AuthorFactory.create_local_author("alice").unwrap();
        let mallory = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder().encode_post(group(), 77, None, &alice, "hi").unwrap();
        assert!(matches!(
            MessageValidator.validate_post(&post.message, mallory.author()),
            Err(EncodeError::Crypto(CryptoError::InvalidSignature))
        ));
    }

    #[test]
    fn test_restamped_post_rejected() {
        let author = AuthorFactory.create_local_author("alice").unwrap();
        let post = encoder().encode_post(group(), 77, None, &author, "hi").unwrap();
        // Same body, different timestamp
        let moved = MessageFactory
            .create_message(group(), 78, post.message.body().to_vec())
            .unwrap();
        assert!(MessageValidator.validate_post(&moved, author.author()).is_err());
    }

    #[test]
    fn test_valid_comment() {
        let author = AuthorFactory.create_local_author("bob").unwrap();
        let original = MessageId::from_bytes([5; HASH_SIZE]);
        let current = MessageId::from_bytes([6; HASH_SIZE]);
        let comment = encoder()
            .encode_comment(group(), &author, Some("nice"), original, current)
            .unwrap();
        let content = MessageValidator
            .validate_comment(&comment.message, author.author())
            .unwrap();
        assert_eq!(content.comment.as_deref(), Some("nice"));
        assert_eq!(content.parent_original, original);
        assert_eq!(content.parent_current, current);

        // A comment is not a post
        assert!(MessageValidator
            .validate_post(&comment.message, author.author())
            .is_err());
    }
}
