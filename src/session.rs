//! Explicit session state.
//!
//! A [`Session`] pairs an authenticated identity with its member row and is passed
//! to whatever needs to act on someone's behalf. [`SessionWatch`] holds the current
//! session for long-lived callers and tells subscribers when it changes.

use crate::changes::{Registry, Subscription};
use crate::error::Result;
use crate::schema::{Member, NewMember};
use crate::store::MessStore;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Identity asserted by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    /// Name from the provider's user metadata, if any.
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub identity: Identity,
    pub member: Member,
}

impl Session {
    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn member_id(&self) -> &str {
        &self.member.id
    }

    /// Member name, then login email, then "Guest".
    pub fn display_name(&self) -> &str {
        self.member
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.identity.email.as_deref())
            .unwrap_or("Guest")
    }
}

/// Member row linked to `identity`, created on first sign-in.
pub async fn ensure_member(store: &dyn MessStore, identity: &Identity) -> Result<Member> {
    if let Some(existing) = store.find_member_by_auth_id(&identity.user_id).await? {
        return Ok(existing);
    }

    let name = identity
        .display_name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| identity.email.clone());
    let created = store
        .insert_member(NewMember {
            auth_user_id: Some(identity.user_id.clone()),
            name,
            email: identity.email.clone(),
            phone: None,
        })
        .await?;
    info!("Created member {} for identity {}", created.id, identity.user_id);
    Ok(created)
}

pub async fn open_session(store: &dyn MessStore, identity: Identity) -> Result<Session> {
    let member = ensure_member(store, &identity).await?;
    Ok(Session { identity, member })
}

/// Current session plus change notification. `None` means signed out.
pub struct SessionWatch {
    current: Mutex<Option<Arc<Session>>>,
    listeners: Arc<Registry<Option<Arc<Session>>>>,
}

impl Default for SessionWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionWatch {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
            listeners: Registry::new(),
        }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current.lock().ok().and_then(|c| c.clone())
    }

    pub fn set(&self, session: Session) {
        self.replace(Some(Arc::new(session)));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    fn replace(&self, next: Option<Arc<Session>>) {
        if let Ok(mut current) = self.current.lock() {
            *current = next.clone();
        }
        self.listeners.notify(&next);
    }

    /// Calls `callback` with every new value until the handle is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&Session>) + Send + Sync + 'static,
    {
        self.listeners
            .register(Arc::new(move |session: &Option<Arc<Session>>| {
                callback(session.as_deref())
            }))
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(user_id: &str, name: Option<&str>) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            email: Some(format!("{}@mess.test", user_id)),
            display_name: name.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_first_sign_in_creates_member_once() {
        let store = InMemoryStore::new();

        let first = ensure_member(&store, &identity("u1", Some("Rafi"))).await.unwrap();
        let again = ensure_member(&store, &identity("u1", Some("Rafi"))).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(first.name.as_deref(), Some("Rafi"));
        assert_eq!(first.auth_user_id.as_deref(), Some("u1"));
        assert_eq!(store.get_members().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_member_name_falls_back_to_email() {
        let store = InMemoryStore::new();
        let session = open_session(&store, identity("u2", None)).await.unwrap();
        assert_eq!(session.member().name.as_deref(), Some("u2@mess.test"));
        assert_eq!(session.display_name(), "u2@mess.test");
    }

    #[tokio::test]
    async fn test_watch_notifies_until_cancelled() {
        let store = InMemoryStore::new();
        let watch = SessionWatch::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let signed_in = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let seen = seen.clone();
            let signed_in = signed_in.clone();
            watch.subscribe(move |session| {
                seen.fetch_add(1, Ordering::SeqCst);
                if session.is_some() {
                    signed_in.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        watch.set(open_session(&store, identity("u3", Some("Mim"))).await.unwrap());
        assert_eq!(watch.current().unwrap().member().name.as_deref(), Some("Mim"));
        watch.clear();
        assert!(watch.current().is_none());

        subscription.cancel();
        watch.set(open_session(&store, identity("u3", None)).await.unwrap());

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(signed_in.load(Ordering::SeqCst), 1);
        assert_eq!(watch.subscriber_count(), 0);
    }
}
