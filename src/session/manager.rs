//! Session ownership and routing.
//!
//! The manager owns every live session and the bidirectional index between
//! route keys and session ids. The two tables live behind a single lock so
//! no code path can ever remove a session from one side without the other.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::config::App;
use crate::identity;
#[cfg(unix)]
use crate::poller::Poller;
use crate::session::app::AppSession;
#[cfg(unix)]
use crate::session::terminal::TerminalSession;
use crate::session::Session;
use crate::two_way_dict::TwoWayDict;
use crate::types::{RouteKey, SessionId};

/// The routing tables, updated together under one lock.
#[derive(Default)]
struct SessionTables {
    sessions: HashMap<SessionId, Arc<dyn Session>>,
    routes: TwoWayDict<RouteKey, SessionId>,
}

/// Manage sessions (framed apps or terminals).
pub struct SessionManager {
    #[cfg(unix)]
    poller: Poller,
    path: PathBuf,
    apps: StdMutex<Vec<App>>,
    apps_by_slug: StdMutex<HashMap<String, App>>,
    tables: StdMutex<SessionTables>,
}

impl SessionManager {
    /// Create a manager serving `apps`, with paths resolved against `path`.
    #[cfg(unix)]
    #[must_use]
    pub fn new(poller: Poller, path: PathBuf, apps: Vec<App>) -> Self {
        let apps_by_slug = apps
            .iter()
            .map(|app| (app.slug.clone(), app.clone()))
            .collect();
        Self {
            poller,
            path,
            apps: StdMutex::new(apps),
            apps_by_slug: StdMutex::new(apps_by_slug),
            tables: StdMutex::new(SessionTables::default()),
        }
    }

    /// Create a manager serving `apps`, with paths resolved against `path`.
    #[cfg(not(unix))]
    #[must_use]
    pub fn new(path: PathBuf, apps: Vec<App>) -> Self {
        let apps_by_slug = apps
            .iter()
            .map(|app| (app.slug.clone(), app.clone()))
            .collect();
        Self {
            path,
            apps: StdMutex::new(apps),
            apps_by_slug: StdMutex::new(apps_by_slug),
            tables: StdMutex::new(SessionTables::default()),
        }
    }

    /// Register an app; a blank slug is auto-generated, and a duplicate
    /// slug silently overwrites the earlier registration.
    pub fn add_app(&self, name: &str, command: &str, slug: &str, terminal: bool) {
        let slug = if slug.is_empty() {
            identity::generate().to_lowercase()
        } else {
            slug.to_string()
        };
        let app = App {
            name: name.to_string(),
            slug: slug.clone(),
            path: "./".to_string(),
            color: String::new(),
            command: command.to_string(),
            terminal,
        };
        self.apps.lock().expect("apps lock poisoned").push(app.clone());
        self.apps_by_slug
            .lock()
            .expect("apps lock poisoned")
            .insert(slug, app);
    }

    /// Snapshot of the registered apps.
    #[must_use]
    pub fn apps(&self) -> Vec<App> {
        self.apps.lock().expect("apps lock poisoned").clone()
    }

    /// Number of registered apps.
    #[must_use]
    pub fn app_count(&self) -> usize {
        self.apps.lock().expect("apps lock poisoned").len()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.tables.lock().expect("tables lock poisoned").sessions.len()
    }

    /// Number of live routes. Always equal to [`Self::session_count`].
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.tables.lock().expect("tables lock poisoned").routes.len()
    }

    /// Create a new session for the app registered under `slug`.
    ///
    /// The session is recorded in both tables and opened at `size`. Returns
    /// `None` for an unknown slug, a terminal app on a platform without PTY
    /// support, or a child that failed to spawn (in which case the tables
    /// are left untouched).
    pub async fn new_session(
        &self,
        slug: &str,
        session_id: SessionId,
        route_key: RouteKey,
        devtools: bool,
        size: (u16, u16),
    ) -> Option<Arc<dyn Session>> {
        let app = self
            .apps_by_slug
            .lock()
            .expect("apps lock poisoned")
            .get(slug)
            .cloned()?;

        let session: Arc<dyn Session> = if app.terminal {
            #[cfg(unix)]
            {
                Arc::new(TerminalSession::new(
                    self.poller.clone(),
                    session_id.clone(),
                    app.command,
                ))
            }
            #[cfg(not(unix))]
            {
                log::warn!("terminals are not supported on this platform");
                return None;
            }
        } else {
            Arc::new(AppSession::new(
                self.path.join(&app.path),
                app.command,
                session_id.clone(),
                devtools,
            ))
        };

        {
            let mut tables = self.tables.lock().expect("tables lock poisoned");
            tables
                .sessions
                .insert(session_id.clone(), Arc::clone(&session));
            tables.routes.set(route_key, session_id.clone());
        }

        let (width, height) = size;
        if let Err(error) = session.open(width, height).await {
            log::debug!("failed to create session: {error:#}");
            self.on_session_end(&session_id);
            return None;
        }

        Some(session)
    }

    /// Close a session by id, if it is still live.
    pub async fn close_session(&self, session_id: &SessionId) {
        let session = self.get_session(session_id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Concurrently close all live sessions, bounded by `timeout`.
    ///
    /// Returns the number of sessions that had not finished closing when
    /// the timeout expired.
    pub async fn close_all(&self, timeout: Duration) -> usize {
        let sessions: Vec<Arc<dyn Session>> = {
            let tables = self.tables.lock().expect("tables lock poisoned");
            tables.sessions.values().map(Arc::clone).collect()
        };
        if sessions.is_empty() {
            return 0;
        }
        log::info!("Closing {} session(s)", sessions.len());

        let total = sessions.len();
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let closers: Vec<_> = sessions
            .into_iter()
            .map(|session| {
                let closed = Arc::clone(&closed);
                tokio::spawn(async move {
                    session.close().await;
                    session.wait().await;
                    closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
            })
            .collect();

        let all_closed = futures_util::future::join_all(closers);
        let remaining = match tokio::time::timeout(timeout, all_closed).await {
            Ok(_) => 0,
            Err(_) => total - closed.load(std::sync::atomic::Ordering::SeqCst),
        };
        if remaining > 0 {
            log::warn!(
                "{remaining} session(s) didn't close after {}s",
                timeout.as_secs()
            );
        }
        remaining
    }

    /// Get a session from a session id.
    #[must_use]
    pub fn get_session(&self, session_id: &SessionId) -> Option<Arc<dyn Session>> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        tables.sessions.get(session_id).map(Arc::clone)
    }

    /// Get a session from a route key.
    #[must_use]
    pub fn get_session_by_route_key(&self, route_key: &RouteKey) -> Option<Arc<dyn Session>> {
        let tables = self.tables.lock().expect("tables lock poisoned");
        let session_id = tables.routes.get(route_key)?;
        tables.sessions.get(session_id).map(Arc::clone)
    }

    /// Called by a session as it finishes: drop it from both tables.
    pub fn on_session_end(&self, session_id: &SessionId) {
        let mut tables = self.tables.lock().expect("tables lock poisoned");
        tables.sessions.remove(session_id);
        tables.routes.delete_by_value(session_id);
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("apps", &self.app_count())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::{ProcessState, SessionConnector};
    use async_trait::async_trait;

    /// Mimics the hub client's connector: removes the session from the
    /// routing tables when it ends.
    struct EndConnector {
        manager: Arc<SessionManager>,
        session_id: SessionId,
    }

    #[async_trait]
    impl SessionConnector for EndConnector {
        async fn on_close(&self) {
            self.manager.on_session_end(&self.session_id);
        }
    }

    fn manager_with_apps() -> Arc<SessionManager> {
        let poller = Poller::new().unwrap();
        poller.start();
        let apps = vec![
            App {
                name: "Echo".to_string(),
                slug: "echo".to_string(),
                path: "./".to_string(),
                color: String::new(),
                // Exits as soon as one byte of stdin (a close's quit frame)
                // arrives.
                command: "printf '__GANGLION__\\n'; head -c 1 >/dev/null".to_string(),
                terminal: false,
            },
            App {
                name: "Shell".to_string(),
                slug: "shell".to_string(),
                path: "./".to_string(),
                color: String::new(),
                command: "sh".to_string(),
                terminal: true,
            },
        ];
        Arc::new(SessionManager::new(poller, std::env::temp_dir(), apps))
    }

    async fn start_session(
        manager: &Arc<SessionManager>,
        slug: &str,
        session_id: &str,
        route_key: &str,
    ) -> Arc<dyn Session> {
        let session = manager
            .new_session(
                slug,
                SessionId::from(session_id),
                RouteKey::from(route_key),
                false,
                (80, 24),
            )
            .await
            .expect("session should be created");
        let connector = Arc::new(EndConnector {
            manager: Arc::clone(manager),
            session_id: SessionId::from(session_id),
        });
        Arc::clone(&session)
            .start(connector as Arc<dyn SessionConnector>)
            .await;
        session
    }

    #[tokio::test]
    async fn test_unknown_slug_returns_none() {
        let manager = manager_with_apps();
        let session = manager
            .new_session(
                "missing",
                SessionId::from("S1"),
                RouteKey::from("R1"),
                false,
                (80, 24),
            )
            .await;
        assert!(session.is_none());
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.route_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_routing_entries() {
        let manager = manager_with_apps();
        manager.add_app("Broken", "whatever", "broken", false);
        // Force the spawn itself to fail with an unreachable working
        // directory.
        {
            let mut apps = manager.apps_by_slug.lock().unwrap();
            apps.get_mut("broken").unwrap().path = "does/not/exist-anywhere".to_string();
        }
        let session = manager
            .new_session(
                "broken",
                SessionId::from("S1"),
                RouteKey::from("R1"),
                false,
                (80, 24),
            )
            .await;
        assert!(session.is_none());
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.route_count(), 0);
    }

    #[tokio::test]
    async fn test_routing_tables_stay_bijective() {
        let manager = manager_with_apps();
        let _session_a = start_session(&manager, "echo", "S1", "R1").await;
        let _session_b = start_session(&manager, "echo", "S2", "R2").await;

        assert_eq!(manager.session_count(), 2);
        assert_eq!(manager.route_count(), 2);
        assert!(manager
            .get_session_by_route_key(&RouteKey::from("R1"))
            .is_some());
        assert!(manager.get_session(&SessionId::from("S2")).is_some());

        manager.on_session_end(&SessionId::from("S1"));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(manager.route_count(), 1);
        assert!(manager
            .get_session_by_route_key(&RouteKey::from("R1"))
            .is_none());

        manager.close_all(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_close_all_converges_to_empty_tables() {
        let manager = manager_with_apps();
        let session_a = start_session(&manager, "echo", "S1", "R1").await;
        let session_b = start_session(&manager, "echo", "S2", "R2").await;

        let failed = manager.close_all(Duration::from_secs(10)).await;
        assert_eq!(failed, 0);
        assert_eq!(session_a.state(), ProcessState::Closed);
        assert_eq!(session_b.state(), ProcessState::Closed);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.route_count(), 0);

        // Closing an already-empty manager is a no-op.
        assert_eq!(manager.close_all(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn test_close_session_ignores_unknown_ids() {
        let manager = manager_with_apps();
        manager.close_session(&SessionId::from("ghost")).await;
    }

    #[tokio::test]
    async fn test_duplicate_slug_overwrites() {
        let manager = manager_with_apps();
        manager.add_app("Echo v2", "echo2-command", "echo", false);
        let apps = manager.apps_by_slug.lock().unwrap();
        assert_eq!(apps.get("echo").unwrap().command, "echo2-command");
    }
}
