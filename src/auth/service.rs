use std::sync::Arc;

use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    auth::{
        dto::{AuthResponse, LoginRequest, PublicUser, RegisterRequest},
        error::AuthError,
        jwt::JwtKeys,
        store::{CredentialStore, NewUser},
    },
    state::AppState,
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

const MIN_PASSWORD_LEN: usize = 6;

/// Orchestrates registration and login against the credential store.
/// Stateless; every call stands alone.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    keys: JwtKeys,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
            keys: JwtKeys::from_ref(state),
        }
    }
}

impl AuthService {
    pub fn new(store: Arc<dyn CredentialStore>, keys: JwtKeys) -> Self {
        Self { store, keys }
    }

    pub async fn register(&self, mut req: RegisterRequest) -> Result<AuthResponse, AuthError> {
        req.email = req.email.trim().to_lowercase();

        if !is_valid_email(&req.email) {
            warn!(email = %req.email, "invalid email");
            return Err(AuthError::Validation("Invalid email".into()));
        }
        if req.name.trim().is_empty() {
            warn!("empty name");
            return Err(AuthError::Validation("Name is required".into()));
        }
        if req.password.len() < MIN_PASSWORD_LEN {
            warn!("password too short");
            return Err(AuthError::Validation("Password too short".into()));
        }

        // Fast path only; the store's unique index decides the race.
        if self.store.find_by_email(&req.email).await?.is_some() {
            warn!(email = %req.email, "email already registered");
            return Err(AuthError::AccountExists);
        }

        let user = self
            .store
            .create(NewUser {
                name: req.name.trim().to_string(),
                email: req.email,
                password: req.password,
                role: req.role,
                phone: req.phone,
                address: req.address,
            })
            .await?;

        let token = self.keys.sign(user.id)?;
        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(AuthResponse {
            token,
            user: PublicUser::from(&user),
        })
    }

    pub async fn login(&self, mut req: LoginRequest) -> Result<AuthResponse, AuthError> {
        req.email = req.email.trim().to_lowercase();

        if !is_valid_email(&req.email) {
            warn!(email = %req.email, "invalid email");
            return Err(AuthError::Validation("Invalid email".into()));
        }

        // Unknown email and wrong password fail identically.
        let user = match self.store.find_by_email(&req.email).await? {
            Some(u) => u,
            None => {
                warn!(email = %req.email, "login unknown email");
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !user.verify_password(&req.password).await? {
            warn!(email = %req.email, user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        let token = self.keys.sign(user.id)?;
        info!(user_id = %user.id, email = %user.email, "user logged in");
        Ok(AuthResponse {
            token,
            user: PublicUser::from(&user),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::store::{memory::MemoryCredentialStore, Role};

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn make_service() -> (AuthService, Arc<MemoryCredentialStore>, JwtKeys) {
        let store = Arc::new(MemoryCredentialStore::default());
        let keys = JwtKeys::from_secret("test-secret", WEEK);
        let service = AuthService::new(store.clone(), keys.clone());
        (service, store, keys)
    }

    fn register_req(email: &str, password: &str) -> RegisterRequest {
        RegisterRequest {
            name: "Test User".into(),
            email: email.into(),
            password: password.into(),
            role: Role::default(),
            phone: None,
            address: None,
        }
    }

    fn login_req(email: &str, password: &str) -> LoginRequest {
        LoginRequest {
            email: email.into(),
            password: password.into(),
        }
    }

    #[tokio::test]
    async fn register_issues_token_bound_to_new_user() {
        let (service, _, keys) = make_service();
        let res = service
            .register(register_req("new@example.com", "secret1"))
            .await
            .expect("register should succeed");

        let claims = keys.verify(&res.token).expect("token should decode");
        assert_eq!(claims.sub, res.user.id);
        assert_eq!(res.user.email, "new@example.com");
        assert_eq!(res.user.role, Role::Customer);
    }

    #[tokio::test]
    async fn distinct_emails_get_distinct_ids() {
        let (service, _, _) = make_service();
        let a = service
            .register(register_req("a@example.com", "secret1"))
            .await
            .unwrap();
        let b = service
            .register(register_req("b@example.com", "secret2"))
            .await
            .unwrap();
        assert_ne!(a.user.id, b.user.id);
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let (service, _, _) = make_service();
        service
            .register(register_req("dup@example.com", "secret1"))
            .await
            .unwrap();
        let err = service
            .register(register_req("dup@example.com", "secret2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountExists));
    }

    #[tokio::test]
    async fn duplicate_email_differing_in_case_is_rejected() {
        let (service, _, _) = make_service();
        service
            .register(register_req("case@example.com", "secret1"))
            .await
            .unwrap();
        let err = service
            .register(register_req("  Case@Example.COM ", "secret2"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AccountExists));
    }

    #[tokio::test]
    async fn concurrent_duplicate_registration_creates_one_account() {
        let (service, store, _) = make_service();
        let (r1, r2) = tokio::join!(
            service.register(register_req("race@example.com", "secret1")),
            service.register(register_req("race@example.com", "secret2")),
        );

        let succeeded = [r1.is_ok(), r2.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(succeeded, 1);

        let err = if r1.is_err() {
            r1.unwrap_err()
        } else {
            r2.unwrap_err()
        };
        assert!(matches!(err, AuthError::AccountExists));

        // Exactly one record made it into the store.
        assert!(store
            .find_by_email("race@example.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn login_with_correct_password_succeeds() {
        let (service, _, keys) = make_service();
        let registered = service
            .register(register_req("user@example.com", "secret1"))
            .await
            .unwrap();

        let logged_in = service
            .login(login_req("user@example.com", "secret1"))
            .await
            .expect("login should succeed");
        assert_eq!(logged_in.user.id, registered.user.id);
        assert_eq!(
            keys.verify(&logged_in.token).unwrap().sub,
            registered.user.id
        );
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_email_fail_identically() {
        let (service, _, _) = make_service();
        service
            .register(register_req("known@example.com", "secret1"))
            .await
            .unwrap();

        let wrong_password = service
            .login(login_req("known@example.com", "wrong"))
            .await
            .unwrap_err();
        let unknown_email = service
            .login(login_req("nobody@example.com", "secret1"))
            .await
            .unwrap_err();

        assert!(matches!(wrong_password, AuthError::InvalidCredentials));
        assert!(matches!(unknown_email, AuthError::InvalidCredentials));
        assert_eq!(wrong_password.to_string(), unknown_email.to_string());
    }

    #[tokio::test]
    async fn stored_record_never_holds_plaintext() {
        let (service, store, _) = make_service();
        let plaintext = "hunter2secret";
        service
            .register(register_req("vault@example.com", plaintext))
            .await
            .unwrap();

        let user = store
            .find_by_email("vault@example.com")
            .await
            .unwrap()
            .expect("record should exist");
        assert_ne!(user.password_hash, plaintext);
        assert!(!user.password_hash.contains(plaintext));
        assert!(user.password_hash.starts_with("$2"));
    }

    #[tokio::test]
    async fn auth_response_serialization_excludes_hash() {
        let (service, store, _) = make_service();
        let res = service
            .register(register_req("json@example.com", "secret1"))
            .await
            .unwrap();

        let hash = store
            .find_by_email("json@example.com")
            .await
            .unwrap()
            .unwrap()
            .password_hash;

        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains("\"token\""));
        assert!(!json.contains(&hash));
        assert!(!json.contains("password"));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let (service, _, _) = make_service();

        let bad_email = service
            .register(register_req("not-an-email", "secret1"))
            .await
            .unwrap_err();
        assert!(matches!(bad_email, AuthError::Validation(_)));

        let short_password = service
            .register(register_req("ok@example.com", "short"))
            .await
            .unwrap_err();
        assert!(matches!(short_password, AuthError::Validation(_)));

        let mut no_name = register_req("ok@example.com", "secret1");
        no_name.name = "   ".into();
        let err = service.register(no_name).await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn login_normalizes_email() {
        let (service, _, _) = make_service();
        service
            .register(register_req("  Mixed@Example.com ", "secret1"))
            .await
            .unwrap();

        let res = service
            .login(login_req("mixed@example.com", "secret1"))
            .await
            .expect("login should succeed");
        assert_eq!(res.user.email, "mixed@example.com");
    }

    #[tokio::test]
    async fn register_then_duplicate_then_bad_then_good_login() {
        let (service, _, keys) = make_service();

        let first = service
            .register(register_req("a@x.com", "secret1"))
            .await
            .expect("register should succeed");
        let t1 = keys.verify(&first.token).unwrap();

        let dup = service
            .register(register_req("a@x.com", "secret1"))
            .await
            .unwrap_err();
        assert!(matches!(dup, AuthError::AccountExists));

        let bad = service.login(login_req("a@x.com", "wrong")).await.unwrap_err();
        assert!(matches!(bad, AuthError::InvalidCredentials));

        let good = service
            .login(login_req("a@x.com", "secret1"))
            .await
            .expect("login should succeed");
        let t2 = keys.verify(&good.token).unwrap();
        assert_eq!(t1.sub, t2.sub);
        assert_eq!(t2.sub, first.user.id);
    }
}
