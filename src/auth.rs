//! Token issuance, hashed password, and the recovery-question flow.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::error::AppError;
use crate::store::{SqlParam, Store};

/// Default password, used until the operator changes it or until a
/// security-question recovery resets it.
pub const DEFAULT_PASSWORD: &str = "admin123";

/// Session lifetime (`T_AUTH`).
pub const SESSION_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// The literal "I acknowledge the risk" confirmation string required by
/// the recovery flow.
pub const RISK_CONFIRMATION: &str = "已知晓风险";

/// Performs (or fakes, in tests) the destructive system action
/// `factoryReset()` ends with.
pub trait SystemControl: Send + Sync {
    /// Reboot the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the reboot command could not be issued.
    fn reboot(&self) -> std::io::Result<()>;
}

/// Issues the real `reboot` command.
#[derive(Debug, Default)]
pub struct RealSystemControl;

impl SystemControl for RealSystemControl {
    fn reboot(&self) -> std::io::Result<()> {
        std::process::Command::new("reboot").status()?;
        Ok(())
    }
}

/// Records that a reboot was requested without performing one; used in
/// tests.
#[derive(Debug, Default)]
pub struct NoopSystemControl {
    /// `requested`.
    pub requested: std::sync::atomic::AtomicBool,
}

impl SystemControl for NoopSystemControl {
    fn reboot(&self) -> std::io::Result<()> {
        self.requested
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Token issuance, hashed password, and security-question recovery.
pub struct Auth {
    store: Store,
    system: Arc<dyn SystemControl>,
}

/// Caller-supplied recovery request for `/api/auth/password` (forgot-flow).
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    /// `answer1`.
    pub answer1: String,
    /// `answer2`.
    pub answer2: String,
    /// `confirmation`.
    pub confirmation: String,
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Auth {
    #[must_use]
    /// `new`.
    pub fn new(store: Store, system: Arc<dyn SystemControl>) -> Self {
        Self { store, system }
    }

    async fn password_hash(&self) -> Result<String, AppError> {
        match self
            .store
            .query_scalar_string("SELECT password_hash FROM auth_state WHERE id = 1", &[])
            .await
        {
            Ok(hash) => Ok(hash),
            Err(crate::store::StoreError::NotFound { .. }) => {
                let default_hash = sha256_hex(DEFAULT_PASSWORD);
                self.store
                    .exec(
                        "INSERT INTO auth_state (id, password_hash) VALUES (1, ?)",
                        &[SqlParam::from(default_hash.clone())],
                    )
                    .await?;
                Ok(default_hash)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify `password` against the stored hash and, on success, issue a
    /// new session token.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthenticated` if the password does not match.
    #[instrument(skip(self, password))]
    pub async fn login(&self, password: &str) -> Result<String, AppError> {
        let expected = self.password_hash().await?;
        if sha256_hex(password) != expected {
            return Err(AppError::Unauthenticated);
        }
        let token = generate_token();
        let created = now_unix();
        self.store
            .exec(
                "INSERT INTO auth_tokens (token, created_at, expires_at) VALUES (?, ?, ?)",
                &[
                    SqlParam::from(token.clone()),
                    SqlParam::from(created),
                    SqlParam::from(created + SESSION_LIFETIME_SECS),
                ],
            )
            .await?;
        Ok(token)
    }

    /// Check a bearer token for existence and non-expiry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthenticated` if the token is missing or
    /// expired.
    pub async fn verify(&self, token: &str) -> Result<(), AppError> {
        let expires_at = self
            .store
            .query_scalar_int(
                "SELECT expires_at FROM auth_tokens WHERE token = ?",
                &[SqlParam::from(token)],
            )
            .await
            .map_err(|_| AppError::Unauthenticated)?;

        if expires_at < now_unix() {
            return Err(AppError::Unauthenticated);
        }
        Ok(())
    }

    /// Delete a token.
    ///
    /// # Errors
    ///
    /// Returns an error only on a database failure.
    pub async fn logout(&self, token: &str) -> Result<(), AppError> {
        self.store
            .exec("DELETE FROM auth_tokens WHERE token = ?", &[SqlParam::from(token)])
            .await?;
        Ok(())
    }

    /// Verify the old password, store the new hash, and invalidate every
    /// outstanding token: all previously-issued tokens fail
    /// `verify` afterwards).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthenticated` if `old` does not match.
    pub async fn change_password(&self, old: &str, new: &str) -> Result<(), AppError> {
        let expected = self.password_hash().await?;
        if sha256_hex(old) != expected {
            return Err(AppError::Unauthenticated);
        }
        let new_hash = sha256_hex(new);
        self.store
            .exec(
                "UPDATE auth_state SET password_hash = ? WHERE id = 1",
                &[SqlParam::from(new_hash)],
            )
            .await?;
        self.store.exec("DELETE FROM auth_tokens", &[]).await?;
        Ok(())
    }

    /// Set the recovery questions exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if the questions were already set.
    pub async fn setup_security_questions(
        &self,
        question1: &str,
        question2: &str,
        answer1: &str,
        answer2: &str,
    ) -> Result<(), AppError> {
        if self.security_questions_are_set().await? {
            return Err(AppError::Conflict("security questions already set".to_string()));
        }
        let a1 = sha256_hex(answer1);
        let a2 = sha256_hex(answer2);
        self.store
            .exec(
                "INSERT INTO security_questions (id, question1, question2, answer1_hash, answer2_hash, created_at) \
                 VALUES (1, ?, ?, ?, ?, ?)",
                &[
                    SqlParam::from(question1),
                    SqlParam::from(question2),
                    SqlParam::from(a1),
                    SqlParam::from(a2),
                    SqlParam::from(now_unix()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn security_questions_are_set(&self) -> Result<bool, AppError> {
        match self
            .store
            .query_scalar_string("SELECT answer1_hash FROM security_questions WHERE id = 1", &[])
            .await
        {
            Ok(hash) => Ok(is_well_formed_sha256_hex(&hash)),
            Err(crate::store::StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_recovery(&self, req: &RecoveryRequest) -> Result<(), AppError> {
        if req.confirmation != RISK_CONFIRMATION {
            return Err(AppError::Unauthenticated);
        }
        let (a1_hash, a2_hash) = self
            .store
            .query_rows(
                "SELECT answer1_hash, answer2_hash FROM security_questions WHERE id = 1",
                &[],
                1,
            )
            .await?
            .into_iter()
            .next()
            .map(|row| (row[0].clone(), row[1].clone()))
            .ok_or(AppError::NotFound("security questions not set".to_string()))?;

        if sha256_hex(&req.answer1) != a1_hash || sha256_hex(&req.answer2) != a2_hash {
            return Err(AppError::Unauthenticated);
        }
        Ok(())
    }

    /// Recover access: verify the security questions, reset the password
    /// to the documented default, and invalidate all tokens.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthenticated` if the recovery request does
    /// not check out.
    pub async fn reset_password(&self, req: &RecoveryRequest) -> Result<(), AppError> {
        self.verify_recovery(req).await?;
        let default_hash = sha256_hex(DEFAULT_PASSWORD);
        self.store
            .exec(
                "UPDATE auth_state SET password_hash = ? WHERE id = 1",
                &[SqlParam::from(default_hash)],
            )
            .await?;
        self.store.exec("DELETE FROM auth_tokens", &[]).await?;
        Ok(())
    }

    /// Recover access and wipe the device: verify the security questions,
    /// truncate every owned table, vacuum, and reboot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unauthenticated` if the recovery request does
    /// not check out, or a database/IO error if cleanup fails.
    pub async fn factory_reset(&self, req: &RecoveryRequest) -> Result<(), AppError> {
        self.verify_recovery(req).await?;

        for table in [
            "auth_tokens",
            "auth_state",
            "security_questions",
            "apn_templates",
            "apn_config",
            "sms_messages",
            "sent_sms",
            "sms_webhook_config",
            "sms_config",
            "ipv6_rules",
            "ipv6_config",
            "rathole_config",
            "rathole_services",
        ] {
            self.store.exec(&format!("DELETE FROM {table}"), &[]).await?;
        }
        self.store.exec("VACUUM", &[]).await?;
        self.system.reboot().map_err(AppError::from)?;
        Ok(())
    }
}

fn is_well_formed_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreConfig, StorePath};
    use tempfile::tempdir;

    async fn test_auth() -> (Auth, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = StorePath::new(dir.path().join("test.db")).unwrap();
        let store = Store::initialize(StoreConfig::for_testing(path)).await.unwrap();
        (Auth::new(store, Arc::new(NoopSystemControl::default())), dir)
    }

    #[tokio::test]
    async fn login_with_default_password_succeeds_then_verifies() {
        let (auth, _dir) = test_auth().await;
        let token = auth.login(DEFAULT_PASSWORD).await.unwrap();
        assert!(auth.verify(&token).await.is_ok());
    }

    #[tokio::test]
    async fn login_with_wrong_password_fails() {
        let (auth, _dir) = test_auth().await;
        assert!(auth.login("wrong").await.is_err());
    }

    #[tokio::test]
    async fn change_password_invalidates_all_prior_tokens() {
        let (auth, _dir) = test_auth().await;
        let token = auth.login(DEFAULT_PASSWORD).await.unwrap();
        auth.change_password(DEFAULT_PASSWORD, "new-password").await.unwrap();
        assert!(auth.verify(&token).await.is_err());
        assert!(auth.login("new-password").await.is_ok());
    }

    #[tokio::test]
    async fn security_questions_can_only_be_set_once() {
        let (auth, _dir) = test_auth().await;
        auth.setup_security_questions("q1", "q2", "a1", "a2").await.unwrap();
        let err = auth
            .setup_security_questions("q1", "q2", "a1", "a2")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn reset_password_requires_risk_confirmation() {
        let (auth, _dir) = test_auth().await;
        auth.setup_security_questions("q1", "q2", "a1", "a2").await.unwrap();
        let bad_req = RecoveryRequest {
            answer1: "a1".to_string(),
            answer2: "a2".to_string(),
            confirmation: "nope".to_string(),
        };
        assert!(auth.reset_password(&bad_req).await.is_err());

        let good_req = RecoveryRequest {
            answer1: "a1".to_string(),
            answer2: "a2".to_string(),
            confirmation: RISK_CONFIRMATION.to_string(),
        };
        auth.reset_password(&good_req).await.unwrap();
        assert!(auth.login(DEFAULT_PASSWORD).await.is_ok());
    }
}
