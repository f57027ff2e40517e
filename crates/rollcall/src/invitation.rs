//! Invitation-code generation, validation, and atomic redemption.
//!
//! A code links one guardian account to one subject record. Generation is
//! collision-tolerant (probabilistic draw, then a uniqueness check);
//! redemption is the atomicity boundary: a single store transaction links
//! both sides and consumes the code, so no observer ever sees a half-formed
//! link and concurrent redeemers produce exactly one winner.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::InvitationConfig;
use crate::error::{Error, Result};
use crate::model::{Guardian, InvitationCode};
use crate::store::{collections, fields, from_doc, to_doc, DocumentStore, TransactFn};

/// Code alphabet: uppercase letters and digits, 36 symbols.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a generated code.
const CODE_LENGTH: usize = 6;

/// Generates, validates, and redeems linking codes.
pub struct InvitationCodeRegistry {
    store: Arc<dyn DocumentStore>,
    config: InvitationConfig,
}

impl std::fmt::Debug for InvitationCodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvitationCodeRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InvitationCodeRegistry {
    /// Create a registry over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, config: InvitationConfig) -> Self {
        Self { store, config }
    }

    /// Draw a random 6-character code from the 36-symbol alphabet.
    fn draw_code() -> String {
        let mut rng = rand::thread_rng();
        (0..CODE_LENGTH)
            .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
            .collect()
    }

    /// Check whether an unused row already holds this code value.
    async fn code_in_use(&self, code: &str) -> Result<bool> {
        let rows = self
            .store
            .find_by_field(collections::INVITATION_CODES, "code", &json!(code))
            .await?;
        Ok(rows.iter().any(|row| row.get("used") == Some(&Value::Bool(false))))
    }

    /// Generate a new invitation code for a subject.
    ///
    /// Draws are redrawn on collision with an existing unused row. Two
    /// concurrent generators can still pick the same value (the uniqueness
    /// check is check-then-act); that is tolerated because redemption, not
    /// generation, is the atomicity boundary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExhaustedRetries`] when the collision budget is
    /// spent, or a store error.
    pub async fn generate(
        &self,
        subject_id: &str,
        subject_name: &str,
        issuer_id: &str,
        class_id: &str,
    ) -> Result<InvitationCode> {
        let mut code = None;
        for attempt in 0..self.config.max_generate_attempts {
            let candidate = Self::draw_code();
            if self.code_in_use(&candidate).await? {
                debug!(attempt, "code collision, redrawing");
                continue;
            }
            code = Some(candidate);
            break;
        }

        let Some(code) = code else {
            warn!(
                attempts = self.config.max_generate_attempts,
                subject_id, "exhausted code generation attempts"
            );
            return Err(Error::ExhaustedRetries {
                attempts: self.config.max_generate_attempts,
            });
        };

        let now = Utc::now();
        let mut invitation = InvitationCode {
            id: None,
            code,
            subject_id: subject_id.to_string(),
            subject_name: subject_name.to_string(),
            issuer_id: issuer_id.to_string(),
            class_id: class_id.to_string(),
            created_at: now,
            expires_at: now + chrono::Duration::hours(i64::from(self.config.expiry_hours)),
            used: false,
            used_by: None,
        };

        let id = self
            .store
            .insert(collections::INVITATION_CODES, to_doc(&invitation)?)
            .await?;
        invitation.id = Some(id);

        info!(
            code = %invitation.code,
            subject_id,
            expiry_hours = self.config.expiry_hours,
            "invitation code created"
        );
        Ok(invitation)
    }

    /// Look up a code and check it is redeemable.
    ///
    /// The lookup is case-insensitive; `used` is checked before expiry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown codes, [`Error::CodeAlreadyUsed`]
    /// for consumed ones, and [`Error::CodeExpired`] for stale ones.
    pub async fn validate(&self, code: &str) -> Result<InvitationCode> {
        let normalized = code.trim().to_uppercase();
        let rows = self
            .store
            .find_by_field(collections::INVITATION_CODES, "code", &json!(normalized))
            .await?;

        if rows.is_empty() {
            return Err(Error::not_found("invitation code", normalized));
        }

        // A collision can leave several rows with the same value; at most one
        // of them is unused and unexpired. Prefer an unused row so a stale
        // sibling doesn't shadow the live one.
        let now = Utc::now();
        let candidates: Vec<InvitationCode> = rows
            .into_iter()
            .map(from_doc)
            .collect::<Result<_>>()?;
        let candidate = candidates
            .iter()
            .find(|row| !row.used && !row.is_expired_at(now))
            .or_else(|| candidates.iter().find(|row| !row.used))
            .or_else(|| candidates.first())
            .cloned()
            .ok_or_else(|| Error::not_found("invitation code", normalized.clone()))?;

        if candidate.used {
            return Err(Error::CodeAlreadyUsed);
        }
        if candidate.is_expired_at(now) {
            return Err(Error::CodeExpired);
        }
        Ok(candidate)
    }

    /// Redeem a code: atomically link the subject to the redeeming guardian
    /// and consume the code.
    ///
    /// All four writes (subject guardian reference, guardian subject set,
    /// code `used` flag and `used_by`) commit in one transaction. A store
    /// write-conflict is retried once after re-validating, so the loser of
    /// a concurrent redemption observes [`Error::CodeAlreadyUsed`].
    ///
    /// # Errors
    ///
    /// Returns validation errors, [`Error::NotFound`] if the subject or
    /// guardian record is missing, or a store error.
    pub async fn redeem(&self, code: &str, actor_id: &str) -> Result<()> {
        let invitation = self.validate(code).await?;

        match self
            .store
            .transact(Self::redeem_body(&invitation, actor_id))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_write_conflict() => {
                debug!(code = %invitation.code, "redeem transaction conflict, retrying once");
                let revalidated = self.validate(code).await?;
                self.store
                    .transact(Self::redeem_body(&revalidated, actor_id))
                    .await?;
            }
            Err(err) => return Err(err),
        }

        info!(code = %invitation.code, subject_id = %invitation.subject_id, actor_id, "code redeemed");
        Ok(())
    }

    /// Build the redemption transaction body.
    fn redeem_body(invitation: &InvitationCode, actor_id: &str) -> TransactFn {
        let invitation = invitation.clone();
        let actor_id = actor_id.to_string();

        Box::new(move |tx| {
            let code_id = invitation
                .id
                .as_deref()
                .ok_or_else(|| Error::internal("invitation code missing id"))?;

            // Re-read inside the transaction: a concurrent redeemer may have
            // consumed the code between validation and commit.
            let code_doc = tx
                .get(collections::INVITATION_CODES, code_id)?
                .ok_or_else(|| Error::not_found("invitation code", code_id))?;
            let current: InvitationCode = from_doc(code_doc)?;
            if current.used {
                return Err(Error::CodeAlreadyUsed);
            }

            tx.get(collections::SUBJECTS, &invitation.subject_id)?
                .ok_or_else(|| Error::not_found("subject", invitation.subject_id.clone()))?;

            let guardian_doc = tx
                .get(collections::GUARDIANS, &actor_id)?
                .ok_or_else(|| Error::not_found("guardian", actor_id.clone()))?;
            let guardian: Guardian = from_doc(guardian_doc)?;

            tx.merge(
                collections::SUBJECTS,
                &invitation.subject_id,
                fields(&[("guardian_id", json!(actor_id))]),
            )?;

            // Idempotent append to the guardian's subject set.
            let mut linked = guardian.linked_subject_ids;
            if !linked.iter().any(|id| id == &invitation.subject_id) {
                linked.push(invitation.subject_id.clone());
            }
            tx.merge(
                collections::GUARDIANS,
                &actor_id,
                fields(&[("linked_subject_ids", json!(linked))]),
            )?;

            tx.merge(
                collections::INVITATION_CODES,
                code_id,
                fields(&[("used", json!(true)), ("used_by", json!(actor_id))]),
            )?;

            Ok(())
        })
    }

    /// List all codes issued for a subject, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn codes_for_subject(&self, subject_id: &str) -> Result<Vec<InvitationCode>> {
        let rows = self
            .store
            .find_by_field(collections::INVITATION_CODES, "subject_id", &json!(subject_id))
            .await?;

        let mut codes: Vec<InvitationCode> = rows.into_iter().map(from_doc).collect::<Result<_>>()?;
        codes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(codes)
    }

    /// Delete a code row (issuer cleanup after consumption or expiry).
    ///
    /// # Errors
    ///
    /// Returns an error if the store operation fails.
    pub async fn delete(&self, code_id: &str) -> Result<()> {
        self.store
            .delete(collections::INVITATION_CODES, code_id)
            .await?;
        debug!(code_id, "invitation code deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Subject;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    fn registry(store: Arc<MemoryStore>) -> InvitationCodeRegistry {
        InvitationCodeRegistry::new(store, InvitationConfig::default())
    }

    async fn seed_subject(store: &MemoryStore, name: &str) -> String {
        let subject = Subject {
            id: None,
            name: name.to_string(),
            class_id: "c-1".to_string(),
            guardian_id: None,
        };
        store
            .insert(collections::SUBJECTS, to_doc(&subject).unwrap())
            .await
            .unwrap()
    }

    async fn seed_guardian(store: &MemoryStore, name: &str) -> String {
        let guardian = Guardian {
            id: None,
            name: name.to_string(),
            linked_subject_ids: Vec::new(),
            device_token: None,
        };
        store
            .insert(collections::GUARDIANS, to_doc(&guardian).unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_draw_code_shape() {
        for _ in 0..100 {
            let code = InvitationCodeRegistry::draw_code();
            assert_eq!(code.len(), 6);
            assert!(code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_generate_creates_unused_code() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let invitation = registry
            .generate("s-1", "Sam", "r-1", "c-1")
            .await
            .unwrap();

        assert!(invitation.id.is_some());
        assert!(!invitation.used);
        assert!(invitation.used_by.is_none());
        assert_eq!(invitation.subject_id, "s-1");

        // Default window is 24 hours.
        let window = invitation.expires_at - invitation.created_at;
        assert_eq!(window, chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_generate_exhausts_collision_budget() {
        // Store double that reports every draw as colliding.
        #[derive(Debug)]
        struct AlwaysColliding;

        #[async_trait]
        impl DocumentStore for AlwaysColliding {
            async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
                Ok(None)
            }
            async fn find_by_field(&self, _: &str, _: &str, _: &Value) -> Result<Vec<Value>> {
                Ok(vec![json!({"used": false})])
            }
            async fn insert(&self, _: &str, _: Value) -> Result<String> {
                Err(Error::internal("unexpected insert"))
            }
            async fn insert_batch(&self, _: &str, _: Vec<Value>) -> Result<Vec<String>> {
                Err(Error::internal("unexpected insert_batch"))
            }
            async fn replace(&self, _: &str, _: &str, _: Value) -> Result<()> {
                Err(Error::internal("unexpected replace"))
            }
            async fn merge(&self, _: &str, _: &str, _: Value) -> Result<()> {
                Err(Error::internal("unexpected merge"))
            }
            async fn delete(&self, _: &str, _: &str) -> Result<()> {
                Err(Error::internal("unexpected delete"))
            }
            async fn transact(&self, _: TransactFn) -> Result<()> {
                Err(Error::internal("unexpected transact"))
            }
        }

        let registry =
            InvitationCodeRegistry::new(Arc::new(AlwaysColliding), InvitationConfig::default());
        let result = registry.generate("s-1", "Sam", "r-1", "c-1").await;

        assert!(matches!(
            result,
            Err(Error::ExhaustedRetries { attempts: 10 })
        ));
    }

    #[tokio::test]
    async fn test_validate_unknown_code() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store);

        let result = registry.validate("ZZZZZZ").await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_validate_is_case_insensitive() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let invitation = registry
            .generate("s-1", "Sam", "r-1", "c-1")
            .await
            .unwrap();

        let found = registry
            .validate(&invitation.code.to_lowercase())
            .await
            .unwrap();
        assert_eq!(found.code, invitation.code);
    }

    #[tokio::test]
    async fn test_validate_expired_code() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let now = Utc::now();
        let expired = InvitationCode {
            id: None,
            code: "OLD001".to_string(),
            subject_id: "s-1".to_string(),
            subject_name: "Sam".to_string(),
            issuer_id: "r-1".to_string(),
            class_id: "c-1".to_string(),
            created_at: now - chrono::Duration::hours(25),
            expires_at: now - chrono::Duration::seconds(1),
            used: false,
            used_by: None,
        };
        store
            .insert(collections::INVITATION_CODES, to_doc(&expired).unwrap())
            .await
            .unwrap();

        // Expired even though unused.
        let result = registry.validate("OLD001").await;
        assert!(matches!(result, Err(Error::CodeExpired)));
    }

    #[tokio::test]
    async fn test_redeem_links_both_sides_atomically() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let subject_id = seed_subject(&store, "Sam").await;
        let guardian_id = seed_guardian(&store, "Pat").await;

        let invitation = registry
            .generate(&subject_id, "Sam", "r-1", "c-1")
            .await
            .unwrap();
        registry.redeem(&invitation.code, &guardian_id).await.unwrap();

        let subject: Subject = from_doc(
            store
                .get(collections::SUBJECTS, &subject_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(subject.guardian_id.as_deref(), Some(guardian_id.as_str()));

        let guardian: Guardian = from_doc(
            store
                .get(collections::GUARDIANS, &guardian_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(guardian.linked_subject_ids.contains(&subject_id));

        let consumed: InvitationCode = from_doc(
            store
                .get(
                    collections::INVITATION_CODES,
                    invitation.id.as_deref().unwrap(),
                )
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(consumed.used);
        assert_eq!(consumed.used_by.as_deref(), Some(guardian_id.as_str()));
    }

    #[tokio::test]
    async fn test_redeem_twice_fails_with_already_used() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let subject_id = seed_subject(&store, "Sam").await;
        let first = seed_guardian(&store, "Pat").await;
        let second = seed_guardian(&store, "Alex").await;

        let invitation = registry
            .generate(&subject_id, "Sam", "r-1", "c-1")
            .await
            .unwrap();

        registry.redeem(&invitation.code, &first).await.unwrap();
        let result = registry.redeem(&invitation.code, &second).await;
        assert!(matches!(result, Err(Error::CodeAlreadyUsed)));

        // The loser must not have touched the link.
        let subject: Subject = from_doc(
            store
                .get(collections::SUBJECTS, &subject_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(subject.guardian_id.as_deref(), Some(first.as_str()));
    }

    #[tokio::test]
    async fn test_redeem_race_has_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry(Arc::clone(&store)));

        let subject_id = seed_subject(&store, "Sam").await;
        let first = seed_guardian(&store, "Pat").await;
        let second = seed_guardian(&store, "Alex").await;

        let invitation = registry
            .generate(&subject_id, "Sam", "r-1", "c-1")
            .await
            .unwrap();

        let (r1, r2) = {
            let (registry1, code1, actor1) =
                (Arc::clone(&registry), invitation.code.clone(), first.clone());
            let (registry2, code2, actor2) =
                (Arc::clone(&registry), invitation.code.clone(), second.clone());
            tokio::join!(
                tokio::spawn(async move { registry1.redeem(&code1, &actor1).await }),
                tokio::spawn(async move { registry2.redeem(&code2, &actor2).await }),
            )
        };
        let outcomes = [r1.unwrap(), r2.unwrap()];

        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(Error::CodeAlreadyUsed))));
    }

    #[tokio::test]
    async fn test_redeem_missing_guardian_leaves_no_partial_link() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let subject_id = seed_subject(&store, "Sam").await;
        let invitation = registry
            .generate(&subject_id, "Sam", "r-1", "c-1")
            .await
            .unwrap();

        let result = registry.redeem(&invitation.code, "g-missing").await;
        assert!(matches!(result, Err(Error::NotFound { .. })));

        // The transaction aborted: code unconsumed, subject unlinked.
        let code: InvitationCode = from_doc(
            store
                .get(
                    collections::INVITATION_CODES,
                    invitation.id.as_deref().unwrap(),
                )
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(!code.used);

        let subject: Subject = from_doc(
            store
                .get(collections::SUBJECTS, &subject_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert!(subject.guardian_id.is_none());
    }

    #[tokio::test]
    async fn test_redeem_is_idempotent_on_guardian_set() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let subject_id = seed_subject(&store, "Sam").await;
        let guardian_id = seed_guardian(&store, "Pat").await;

        // Redeem two different codes for the same subject/guardian pair.
        for _ in 0..2 {
            let invitation = registry
                .generate(&subject_id, "Sam", "r-1", "c-1")
                .await
                .unwrap();
            registry.redeem(&invitation.code, &guardian_id).await.unwrap();
        }

        let guardian: Guardian = from_doc(
            store
                .get(collections::GUARDIANS, &guardian_id)
                .await
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            guardian
                .linked_subject_ids
                .iter()
                .filter(|id| **id == subject_id)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_codes_for_subject_newest_first() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        for _ in 0..3 {
            registry.generate("s-1", "Sam", "r-1", "c-1").await.unwrap();
        }
        registry.generate("s-2", "Ada", "r-1", "c-1").await.unwrap();

        let codes = registry.codes_for_subject("s-1").await.unwrap();
        assert_eq!(codes.len(), 3);
        assert!(codes.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_delete_code() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(Arc::clone(&store));

        let invitation = registry
            .generate("s-1", "Sam", "r-1", "c-1")
            .await
            .unwrap();
        let code_id = invitation.id.clone().unwrap();

        registry.delete(&code_id).await.unwrap();
        assert!(store
            .get(collections::INVITATION_CODES, &code_id)
            .await
            .unwrap()
            .is_none());
    }
}
