//! Write and read paths of the canvas.
//!
//! `UpdateService::apply` runs, in this order:
//!
//! ```text
//! 1. bounds + color          → InvalidRequest
//! 2. credential              → Unauthorized / Forbidden
//! 3. cooldown check-and-record → RateLimited { retry_after }
//! 4. BoardStore::set
//! 5. BroadcastHub::publish   (never awaited on, never fails the write)
//! ```
//!
//! Steps 3 through 5 contain no await point, so once the cooldown slot is
//! claimed the write is applied and published in the same poll. A write the
//! store refuses hands the slot back.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};

use pixelboard_core::{
    BoardSnapshot, BoardStore, Cell, Color, CooldownDecision, CooldownTracker, PixelChange,
};

use crate::auth::{AuthError, Authenticator, Credential, Identity};
use crate::broadcast::BroadcastHub;
use crate::protocol::UpdatePixelRequest;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
    #[error("Credentials do not belong to user {0}")]
    Forbidden(String),
    #[error("Cooldown active. Please wait {:.1} seconds.", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration },
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// A single pixel write as received from a caller.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
    pub user_id: String,
    pub username: String,
    /// Checked after the request shape, so a missing one still yields 400 for bad input.
    pub credential: Option<Credential>,
}

impl UpdateRequest {
    pub fn from_wire(body: UpdatePixelRequest, credential: Option<Credential>) -> Self {
        Self {
            x: body.x,
            y: body.y,
            color: body.color,
            user_id: body.user_id,
            username: body.username,
            credential,
        }
    }
}

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedUpdate {
    pub change: PixelChange,
    pub previous: Color,
    pub identity: Identity,
    /// Subscriber queues that took the broadcast.
    pub delivered: usize,
}

async fn authenticate(
    auth: &dyn Authenticator,
    credential: Option<&Credential>,
    limit: Duration,
) -> Result<Identity, ServiceError> {
    let credential = credential.ok_or(AuthError::Missing)?;
    match timeout(limit, auth.authenticate(credential)).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            log::warn!("Credential validation timed out after {limit:?}");
            Err(ServiceError::Timeout(limit))
        }
    }
}

pub struct UpdateService {
    store: Arc<BoardStore>,
    cooldown: Arc<CooldownTracker>,
    hub: Arc<BroadcastHub>,
    auth: Arc<dyn Authenticator>,
    request_timeout: Duration,
}

impl UpdateService {
    pub fn new(
        store: Arc<BoardStore>,
        cooldown: Arc<CooldownTracker>,
        hub: Arc<BroadcastHub>,
        auth: Arc<dyn Authenticator>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cooldown,
            hub,
            auth,
            request_timeout,
        }
    }

    pub async fn apply(&self, request: UpdateRequest) -> Result<AppliedUpdate, ServiceError> {
        let (cell, color) = self.validate(&request)?;

        let identity =
            authenticate(self.auth.as_ref(), request.credential.as_ref(), self.request_timeout).await?;
        if identity.user_id != request.user_id {
            log::warn!(
                "User {} tried to write as {}",
                identity.user_id,
                request.user_id
            );
            return Err(ServiceError::Forbidden(request.user_id));
        }

        let now = Instant::now().into_std();
        let permit = match self.cooldown.check_and_record(&identity.user_id, now) {
            CooldownDecision::Allowed(permit) => permit,
            CooldownDecision::Denied { retry_after } => {
                log::debug!("User {} rate limited for {retry_after:?}", identity.user_id);
                return Err(ServiceError::RateLimited { retry_after });
            }
        };

        let previous = match self.store.set(cell, color) {
            Ok(previous) => previous,
            Err(e) => {
                log::warn!("Store refused {cell}: {e}");
                self.cooldown.revert(permit);
                return Err(ServiceError::InvalidRequest("Invalid coordinates".to_string()));
            }
        };
        let change = PixelChange::new(cell, color);
        let delivered = self.hub.publish(change);

        log::debug!(
            "{} set {cell} {previous} -> {color} ({delivered} subscribers)",
            identity.username
        );
        Ok(AppliedUpdate {
            change,
            previous,
            identity,
            delivered,
        })
    }

    fn validate(&self, request: &UpdateRequest) -> Result<(Cell, Color), ServiceError> {
        let color: Color = request
            .color
            .parse()
            .map_err(|_| ServiceError::InvalidRequest("Invalid color".to_string()))?;
        let cell = self
            .store
            .dimensions()
            .cell(request.x, request.y)
            .map_err(|_| ServiceError::InvalidRequest("Invalid coordinates".to_string()))?;
        Ok((cell, color))
    }

    pub fn cooldown(&self) -> &Arc<CooldownTracker> {
        &self.cooldown
    }
}

pub struct SnapshotService {
    store: Arc<BoardStore>,
    auth: Arc<dyn Authenticator>,
    request_timeout: Duration,
}

impl SnapshotService {
    pub fn new(store: Arc<BoardStore>, auth: Arc<dyn Authenticator>, request_timeout: Duration) -> Self {
        Self {
            store,
            auth,
            request_timeout,
        }
    }

    /// Full board for a newly joining viewer. Read-only.
    pub async fn get_snapshot(&self, credential: &Credential) -> Result<BoardSnapshot, ServiceError> {
        authenticate(self.auth.as_ref(), Some(credential), self.request_timeout).await?;
        Ok(self.store.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionRegistry;
    use async_trait::async_trait;
    use pixelboard_core::BoardDimensions;

    const COOLDOWN: Duration = Duration::from_secs(5);

    struct Fixture {
        store: Arc<BoardStore>,
        hub: Arc<BroadcastHub>,
        sessions: Arc<SessionRegistry>,
        updates: UpdateService,
        snapshots: SnapshotService,
    }

    fn fixture() -> Fixture {
        fixture_with_auth(None)
    }

    fn fixture_with_auth(auth: Option<Arc<dyn Authenticator>>) -> Fixture {
        let store = Arc::new(BoardStore::new(BoardDimensions::new(20, 20)));
        let hub = Arc::new(BroadcastHub::new(16));
        let sessions = Arc::new(SessionRegistry::new());
        let auth = auth.unwrap_or_else(|| sessions.clone() as Arc<dyn Authenticator>);
        let cooldown = Arc::new(CooldownTracker::new(COOLDOWN));
        let timeout = Duration::from_millis(200);
        Fixture {
            updates: UpdateService::new(store.clone(), cooldown, hub.clone(), auth.clone(), timeout),
            snapshots: SnapshotService::new(store.clone(), auth, timeout),
            store,
            hub,
            sessions,
        }
    }

    fn request(x: i64, y: i64, color: &str, identity: &Identity, credential: &Credential) -> UpdateRequest {
        UpdateRequest {
            x,
            y,
            color: color.to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            credential: Some(credential.clone()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_update_applies_and_publishes() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");
        let mut sub = fx.hub.subscribe();

        let applied = fx.updates.apply(request(5, 5, "red", &id, &cred)).await.unwrap();
        assert_eq!(applied.previous, Color::White);
        assert_eq!(applied.delivered, 1);

        let cell = fx.store.dimensions().cell(5, 5).unwrap();
        assert_eq!(fx.store.get(cell), Some(Color::Red));
        assert_eq!(*sub.recv().await.unwrap(), PixelChange::new(cell, Color::Red));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_bounds_rejected_before_store() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");

        for (x, y) in [(-1, 0), (20, 0), (0, 20), (i64::MAX, 3)] {
            let err = fx.updates.apply(request(x, y, "red", &id, &cred)).await.unwrap_err();
            assert_eq!(err, ServiceError::InvalidRequest("Invalid coordinates".into()));
        }
        assert_eq!(fx.hub.stats().messages_published, 0);
        // Validation failures leave the cooldown untouched.
        assert!(fx.updates.apply(request(1, 1, "red", &id, &cred)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_color_rejected() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");
        let err = fx.updates.apply(request(1, 1, "ultraviolet", &id, &cred)).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid color");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_credential_unauthorized() {
        let fx = fixture();
        let (_, id) = fx.sessions.issue("alice");
        let err = fx
            .updates
            .apply(request(1, 1, "red", &id, &Credential::bearer("forged")))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized(AuthError::Invalid));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credential_checked_after_shape() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");
        let mut req = request(1, 1, "red", &id, &cred);
        req.credential = None;
        let err = fx.updates.apply(req.clone()).await.unwrap_err();
        assert_eq!(err, ServiceError::Unauthorized(AuthError::Missing));

        req.color = "nope".into();
        let err = fx.updates.apply(req).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_id_must_match_identity() {
        let fx = fixture();
        let (cred, mut id) = fx.sessions.issue("alice");
        id.user_id = "someone-else".into();
        let err = fx.updates.apply(request(1, 1, "red", &id, &cred)).await.unwrap_err();
        assert_eq!(err, ServiceError::Forbidden("someone-else".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_enforced_then_released() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");

        fx.updates.apply(request(5, 5, "red", &id, &cred)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        match fx.updates.apply(request(6, 6, "blue", &id, &cred)).await {
            Err(ServiceError::RateLimited { retry_after }) => {
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= COOLDOWN);
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        let cell = fx.store.dimensions().cell(6, 6).unwrap();
        assert_eq!(fx.store.get(cell), Some(Color::White));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(fx.updates.apply(request(6, 6, "blue", &id, &cred)).await.is_ok());
    }

    #[test]
    fn test_rate_limited_message() {
        let err = ServiceError::RateLimited {
            retry_after: Duration::from_millis(3300),
        };
        assert_eq!(err.to_string(), "Cooldown active. Please wait 3.3 seconds.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_updates_last_accepted_wins() {
        let fx = fixture();
        let users: Vec<_> = (0..4).map(|i| fx.sessions.issue(format!("user{i}"))).collect();
        for (i, color) in ["red", "green", "blue", "black"].iter().enumerate() {
            let (cred, id) = &users[i];
            fx.updates.apply(request(3, 3, color, id, cred)).await.unwrap();
        }
        let cell = fx.store.dimensions().cell(3, 3).unwrap();
        assert_eq!(fx.store.get(cell), Some(Color::Black));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_user_single_acceptance() {
        let fx = Arc::new(fixture());
        let (cred, id) = fx.sessions.issue("alice");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let fx = fx.clone();
                let req = request(i, 0, "red", &id, &cred);
                tokio::spawn(async move { fx.updates.apply(req).await })
            })
            .collect();

        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_requires_credential() {
        let fx = fixture();
        let (cred, id) = fx.sessions.issue("alice");
        fx.updates.apply(request(2, 2, "green", &id, &cred)).await.unwrap();

        let snap = fx.snapshots.get_snapshot(&cred).await.unwrap();
        assert_eq!(snap.get(fx.store.dimensions().cell(2, 2).unwrap()), Some(Color::Green));

        assert!(fx.snapshots.get_snapshot(&Credential::bearer("x")).await.is_err());
    }

    struct StalledAuth;

    #[async_trait]
    impl Authenticator for StalledAuth {
        async fn authenticate(&self, _: &Credential) -> Result<Identity, AuthError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_is_transient() {
        let fx = fixture_with_auth(Some(Arc::new(StalledAuth)));
        let id = Identity {
            user_id: "u".into(),
            username: "u".into(),
        };
        let cred = Credential::bearer("t");

        let err = fx.updates.apply(request(1, 1, "red", &id, &cred)).await.unwrap_err();
        assert_eq!(err, ServiceError::Timeout(Duration::from_millis(200)));
        assert!(matches!(
            fx.snapshots.get_snapshot(&cred).await,
            Err(ServiceError::Timeout(_))
        ));
        assert_eq!(fx.store.get(fx.store.dimensions().cell(1, 1).unwrap()), Some(Color::White));
    }
}
