// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! orch-vcs
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;

/// Errors surfaced by a [`VcsProvider`] implementation or the [`VcsFacade`].
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// The webhook signature did not verify against the configured secret.
    #[error("webhook signature verification failed")]
    InvalidSignature,
    /// The referenced pull/merge request does not exist.
    #[error("pull request {0} not found")]
    PullRequestNotFound(String),
    /// The referenced comment does not exist.
    #[error("comment {0} not found")]
    CommentNotFound(String),
    /// The underlying HTTP/transport call failed.
    #[error("vcs provider transport error: {0}")]
    Transport(String),
}

/// A single comment on a pull/merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsComment {
    /// Provider-assigned comment id.
    pub id: String,
    /// Full comment body.
    pub body: String,
}

/// The provider-neutral capability set a VCS integration must implement:
/// `{verify_webhook, list_comments, create/update/delete_comment}`.
/// Business logic — tag-block parsing, upsert decisions — lives outside
/// this trait in [`VcsFacade`], so a GitHub, GitLab, or Bitbucket
/// implementation only has to wire the five methods below.
#[async_trait]
pub trait VcsProvider: Send + Sync {
    /// Verify that `payload` was signed with `signature` by the provider,
    /// using whatever scheme that provider uses (e.g. HMAC-SHA256).
    async fn verify_webhook(&self, payload: &[u8], signature: &str) -> Result<bool, VcsError>;
    /// List every comment currently on `pr_ref`.
    async fn list_comments(&self, pr_ref: &str) -> Result<Vec<VcsComment>, VcsError>;
    /// Create a new comment on `pr_ref`, returning it with its assigned id.
    async fn create_comment(&self, pr_ref: &str, body: &str) -> Result<VcsComment, VcsError>;
    /// Overwrite the body of an existing comment.
    async fn update_comment(&self, pr_ref: &str, comment_id: &str, body: &str) -> Result<(), VcsError>;
    /// Delete an existing comment.
    async fn delete_comment(&self, pr_ref: &str, comment_id: &str) -> Result<(), VcsError>;
}

/// Build the regex that matches a tag-block for `search_tag`: the last
/// line of a comment body in the shape `###<search_tag>### <payload>`.
fn tag_block_pattern(search_tag: &str) -> Regex {
    let escaped = regex::escape(search_tag);
    Regex::new(&format!(r"^###{escaped}###\s*(.*)$")).expect("tag pattern is always valid regex")
}

/// Parse `body`'s last line against `search_tag`'s tag-block pattern,
/// returning the payload captured after the tag if it matches.
///
/// Matching is strict-last-line only: a tag block anywhere but the final
/// line of the body is not recognized, matching the original provider's
/// whole-body-search-then-last-line-match two-step.
pub fn parse_tag_block<'a>(body: &'a str, search_tag: &str) -> Option<&'a str> {
    let last_line = body.lines().next_back()?;
    let pattern = tag_block_pattern(search_tag);
    pattern.captures(last_line).map(|c| c.get(1).map_or("", |m| m.as_str()))
}

/// `true` iff any line in `body` looks like a tag block for `search_tag`,
/// used for the whole-body membership test prior to strict last-line match.
pub fn body_contains_tag(body: &str, search_tag: &str) -> bool {
    let needle = format!("###{search_tag}###");
    body.contains(&needle)
}

/// Format a tag-block comment body: the tag line followed by `payload`.
pub fn format_tag_block(search_tag: &str, payload: &str) -> String {
    format!("###{search_tag}###\n{payload}")
}

/// Provider-neutral tag-block search/upsert logic layered over any
/// [`VcsProvider`].
pub struct VcsFacade<P: VcsProvider> {
    provider: P,
}

impl<P: VcsProvider> VcsFacade<P> {
    /// Wrap `provider` in the tag-block facade.
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Access the wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Find the existing comment on `pr_ref` whose last line matches
    /// `search_tag`'s tag block, if any.
    pub async fn find_tagged_comment(
        &self,
        pr_ref: &str,
        search_tag: &str,
    ) -> Result<Option<VcsComment>, VcsError> {
        let comments = self.provider.list_comments(pr_ref).await?;
        Ok(comments
            .into_iter()
            .find(|c| body_contains_tag(&c.body, search_tag) && parse_tag_block(&c.body, search_tag).is_some()))
    }

    /// Create a comment carrying `search_tag`'s tag block with `payload`
    /// if none exists yet on `pr_ref`, or overwrite the existing one.
    /// Returns the id of the comment that now carries the tag.
    pub async fn upsert_tagged_comment(
        &self,
        pr_ref: &str,
        search_tag: &str,
        payload: &str,
    ) -> Result<String, VcsError> {
        let body = format_tag_block(search_tag, payload);
        match self.find_tagged_comment(pr_ref, search_tag).await? {
            Some(existing) => {
                self.provider.update_comment(pr_ref, &existing.id, &body).await?;
                Ok(existing.id)
            }
            None => {
                let created = self.provider.create_comment(pr_ref, &body).await?;
                Ok(created.id)
            }
        }
    }
}

/// An in-memory [`VcsProvider`] for tests: comments live in a map keyed by
/// `pr_ref`, ids are assigned sequentially, and webhook verification
/// checks against a fixed shared secret configured at construction.
pub struct InMemoryVcsProvider {
    webhook_secret: String,
    comments: RwLock<BTreeMap<String, Vec<VcsComment>>>,
    next_id: RwLock<u64>,
}

impl InMemoryVcsProvider {
    /// Create a provider that accepts `webhook_secret` as its signature.
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            comments: RwLock::new(BTreeMap::new()),
            next_id: RwLock::new(1),
        }
    }
}

#[async_trait]
impl VcsProvider for InMemoryVcsProvider {
    async fn verify_webhook(&self, _payload: &[u8], signature: &str) -> Result<bool, VcsError> {
        Ok(signature == self.webhook_secret)
    }

    async fn list_comments(&self, pr_ref: &str) -> Result<Vec<VcsComment>, VcsError> {
        let comments = self.comments.read().expect("comment lock poisoned");
        Ok(comments.get(pr_ref).cloned().unwrap_or_default())
    }

    async fn create_comment(&self, pr_ref: &str, body: &str) -> Result<VcsComment, VcsError> {
        let mut next_id = self.next_id.write().expect("id lock poisoned");
        let id = next_id.to_string();
        *next_id += 1;
        let comment = VcsComment { id, body: body.to_string() };
        let mut comments = self.comments.write().expect("comment lock poisoned");
        comments.entry(pr_ref.to_string()).or_default().push(comment.clone());
        Ok(comment)
    }

    async fn update_comment(&self, pr_ref: &str, comment_id: &str, body: &str) -> Result<(), VcsError> {
        let mut comments = self.comments.write().expect("comment lock poisoned");
        let list = comments
            .get_mut(pr_ref)
            .ok_or_else(|| VcsError::PullRequestNotFound(pr_ref.to_string()))?;
        let comment = list
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or_else(|| VcsError::CommentNotFound(comment_id.to_string()))?;
        comment.body = body.to_string();
        Ok(())
    }

    async fn delete_comment(&self, pr_ref: &str, comment_id: &str) -> Result<(), VcsError> {
        let mut comments = self.comments.write().expect("comment lock poisoned");
        let list = comments
            .get_mut(pr_ref)
            .ok_or_else(|| VcsError::PullRequestNotFound(pr_ref.to_string()))?;
        let before = list.len();
        list.retain(|c| c.id != comment_id);
        if list.len() == before {
            return Err(VcsError::CommentNotFound(comment_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tag_block_matches_last_line_only() {
        let body = "some unrelated text\n###abcd1234### running";
        assert_eq!(parse_tag_block(body, "abcd1234"), Some("running"));
    }

    #[test]
    fn parse_tag_block_ignores_tag_not_on_last_line() {
        let body = "###abcd1234### running\nmore output after the tag";
        assert_eq!(parse_tag_block(body, "abcd1234"), None);
    }

    #[test]
    fn parse_tag_block_rejects_mismatched_tag() {
        let body = "###abcd1234### running";
        assert_eq!(parse_tag_block(body, "ffff0000"), None);
    }

    #[test]
    fn parse_tag_block_handles_tag_with_no_trailing_payload() {
        let body = "###abcd1234###";
        assert_eq!(parse_tag_block(body, "abcd1234"), Some(""));
    }

    #[test]
    fn body_contains_tag_is_whole_body_search() {
        let body = "line one\n###abcd1234### queued\nline three";
        assert!(body_contains_tag(body, "abcd1234"));
        assert!(!body_contains_tag(body, "ffff0000"));
    }

    #[test]
    fn search_tag_is_regex_escaped() {
        // A search tag containing regex metacharacters must be treated
        // literally, not interpreted.
        let body = "###a.b+c###done";
        assert_eq!(parse_tag_block(body, "a.b+c"), Some("done"));
        assert_eq!(parse_tag_block(body, "aXbXc"), None);
    }

    #[tokio::test]
    async fn verify_webhook_checks_shared_secret() {
        let provider = InMemoryVcsProvider::new("s3cr3t");
        assert!(provider.verify_webhook(b"{}", "s3cr3t").await.unwrap());
        assert!(!provider.verify_webhook(b"{}", "wrong").await.unwrap());
    }

    #[tokio::test]
    async fn upsert_creates_when_no_tagged_comment_exists() {
        let facade = VcsFacade::new(InMemoryVcsProvider::new("secret"));
        let id = facade.upsert_tagged_comment("org/repo#1", "abcd1234", "queued").await.unwrap();
        let comments = facade.provider().list_comments("org/repo#1").await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].id, id);
        assert!(comments[0].body.contains("queued"));
    }

    #[tokio::test]
    async fn upsert_updates_existing_tagged_comment_in_place() {
        let facade = VcsFacade::new(InMemoryVcsProvider::new("secret"));
        facade.upsert_tagged_comment("org/repo#1", "abcd1234", "queued").await.unwrap();
        facade.upsert_tagged_comment("org/repo#1", "abcd1234", "succeeded").await.unwrap();

        let comments = facade.provider().list_comments("org/repo#1").await.unwrap();
        assert_eq!(comments.len(), 1, "must update in place, not create a second comment");
        assert!(comments[0].body.contains("succeeded"));
        assert!(!comments[0].body.contains("queued"));
    }

    #[tokio::test]
    async fn upsert_leaves_differently_tagged_comments_untouched() {
        let facade = VcsFacade::new(InMemoryVcsProvider::new("secret"));
        facade.upsert_tagged_comment("org/repo#1", "run-a", "queued").await.unwrap();
        facade.upsert_tagged_comment("org/repo#1", "run-b", "queued").await.unwrap();

        let comments = facade.provider().list_comments("org/repo#1").await.unwrap();
        assert_eq!(comments.len(), 2);
    }

    #[tokio::test]
    async fn delete_comment_removes_it() {
        let provider = InMemoryVcsProvider::new("secret");
        let created = provider.create_comment("org/repo#1", "hello").await.unwrap();
        provider.delete_comment("org/repo#1", &created.id).await.unwrap();
        let comments = provider.list_comments("org/repo#1").await.unwrap();
        assert!(comments.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_comment_errors() {
        let provider = InMemoryVcsProvider::new("secret");
        provider.create_comment("org/repo#1", "hello").await.unwrap();
        let err = provider.delete_comment("org/repo#1", "nonexistent").await.unwrap_err();
        assert!(matches!(err, VcsError::CommentNotFound(_)));
    }
}
