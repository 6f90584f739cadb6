//! Invitation authentication: nonce generation and SHA-256 digests.
//!
//! Shared-secret auth hashes `nonce ‖ secret`; user auth hashes
//! `nonce ‖ username ‖ password`. The peer proves possession by echoing
//! the digest in an Authorization Reply.

use sha2::{Digest, Sha256};

use crate::command::{self, code, Command, DIGEST_LEN, NONCE_LEN};

/// Credentials for a UDP session. On a client these are presented to the
/// server; on a server they are what peers must prove they hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    SharedSecret(String),
    UserPassword { user: String, password: String },
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    rand::random()
}

pub fn shared_secret_digest(nonce: &[u8; NONCE_LEN], secret: &str) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

pub fn user_password_digest(
    nonce: &[u8; NONCE_LEN],
    user: &str,
    password: &str,
) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(user.as_bytes());
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

impl AuthMethod {
    /// The invitation command a server sends to challenge with `nonce`.
    pub fn challenge(&self, nonce: [u8; NONCE_LEN]) -> Command {
        match self {
            AuthMethod::SharedSecret(_) => Command::InvitationWithAuth { nonce },
            AuthMethod::UserPassword { .. } => Command::InvitationWithUserAuth { nonce },
        }
    }

    /// The capability bit this method occupies in an Invitation.
    pub fn capability(&self) -> u32 {
        match self {
            AuthMethod::SharedSecret(_) => command::CAP_AUTH_SHARED,
            AuthMethod::UserPassword { .. } => command::CAP_AUTH_USER,
        }
    }

    /// Builds the Authorization Reply answering `nonce`.
    pub fn reply(&self, nonce: &[u8; NONCE_LEN]) -> Command {
        match self {
            AuthMethod::SharedSecret(secret) => Command::AuthorizationReply {
                method: code::INVITATION_AUTH,
                digest: shared_secret_digest(nonce, secret),
                username: String::new(),
            },
            AuthMethod::UserPassword { user, password } => Command::AuthorizationReply {
                method: code::INVITATION_USER_AUTH,
                digest: user_password_digest(nonce, user, password),
                username: user.clone(),
            },
        }
    }

    /// Server-side check of a received Authorization Reply against the
    /// nonce this session issued.
    pub fn verify(
        &self,
        nonce: &[u8; NONCE_LEN],
        method: u8,
        digest: &[u8; DIGEST_LEN],
        username: &str,
    ) -> bool {
        match self {
            AuthMethod::SharedSecret(secret) => {
                method == code::INVITATION_AUTH && digest == &shared_secret_digest(nonce, secret)
            }
            AuthMethod::UserPassword { user, password } => {
                method == code::INVITATION_USER_AUTH
                    && username == user
                    && digest == &user_password_digest(nonce, user, password)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_reply_verifies() {
        let auth = AuthMethod::SharedSecret("hunter2".into());
        let nonce = generate_nonce();
        match auth.reply(&nonce) {
            Command::AuthorizationReply { method, digest, username } => {
                assert!(auth.verify(&nonce, method, &digest, &username));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let server = AuthMethod::SharedSecret("right".into());
        let client = AuthMethod::SharedSecret("wrong".into());
        let nonce = generate_nonce();
        match client.reply(&nonce) {
            Command::AuthorizationReply { method, digest, username } => {
                assert!(!server.verify(&nonce, method, &digest, &username));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn user_auth_checks_username_and_method() {
        let server = AuthMethod::UserPassword { user: "alice".into(), password: "pw".into() };
        let nonce = [3u8; NONCE_LEN];
        let digest = user_password_digest(&nonce, "alice", "pw");
        assert!(server.verify(&nonce, code::INVITATION_USER_AUTH, &digest, "alice"));
        assert!(!server.verify(&nonce, code::INVITATION_USER_AUTH, &digest, "bob"));
        assert!(!server.verify(&nonce, code::INVITATION_AUTH, &digest, "alice"));
    }

    #[test]
    fn digest_depends_on_nonce() {
        let a = shared_secret_digest(&[0u8; NONCE_LEN], "s");
        let b = shared_secret_digest(&[1u8; NONCE_LEN], "s");
        assert_ne!(a, b);
    }
}
