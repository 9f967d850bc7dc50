//! `opengnsys` module: reports agent and session lifecycle upstream, and
//! relays logoff, pop-up and script requests down to the sessions.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::Module;
use super::platform::{Notifier, Operations};
use crate::error::{BusError, ModuleError};
use crate::message::LoginRequest;
use crate::network::SessionBus;

pub const MODULE_NAME: &str = "opengnsys";

pub struct SessionReporter {
    notifier: Arc<dyn Notifier>,
    operations: Arc<dyn Operations>,
    sessions: SessionBus,
    logged_in: Mutex<Option<String>>,
}

impl std::fmt::Debug for SessionReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionReporter")
            .field("logged_in", &self.logged_in_user())
            .finish_non_exhaustive()
    }
}

impl SessionReporter {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        operations: Arc<dyn Operations>,
        sessions: SessionBus,
    ) -> Self {
        Self {
            notifier,
            operations,
            sessions,
            logged_in: Mutex::new(None),
        }
    }

    /// Ask every session agent to end its user's session.
    pub fn request_logoff(&self) -> Result<(), BusError> {
        debug!("relaying logoff to sessions");
        self.sessions.send_logoff()
    }

    /// Show a pop-up in every session. Agents answer with `popup_done`.
    pub fn show_popup(&self, title: &str, message: &str) -> Result<(), BusError> {
        debug!("relaying popup \"{title}\" to sessions");
        self.sessions.send_popup(title, message)
    }

    /// Run `script` through the shell of every session agent.
    pub fn run_in_sessions(&self, script: &str) -> Result<(), BusError> {
        debug!("relaying {} byte script to sessions", script.len());
        self.sessions.send_script(script.as_bytes().to_vec())
    }

    /// User of the most recent login not yet followed by a logout.
    pub fn logged_in_user(&self) -> Option<String> {
        self.logged_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn host(&self) -> Value {
        json!({
            "ostype": self.operations.os_type(),
            "osversion": self.operations.os_version(),
        })
    }

    fn set_logged_in(&self, user: Option<String>) {
        *self.logged_in.lock().unwrap_or_else(PoisonError::into_inner) = user;
    }
}

#[async_trait]
impl Module for SessionReporter {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn activate(&self) -> Result<(), ModuleError> {
        self.notifier.notify("ogagent/started", self.host()).await
    }

    async fn deactivate(&self) -> Result<(), ModuleError> {
        self.notifier.notify("ogagent/stopped", self.host()).await
    }

    async fn process(&self, message: &str, data: Value) -> Result<(), ModuleError> {
        debug!("client message {message}: {data}");
        match message {
            "popup_done" => self.notifier.notify("popup_done", data).await,
            other => Err(ModuleError::UnknownMessage(other.to_string())),
        }
    }

    async fn on_login(&self, login: &LoginRequest) -> Result<(), ModuleError> {
        self.set_logged_in(Some(login.username.clone()));
        let mut payload = self.host();
        payload["user"] = json!(login.username);
        payload["language"] = json!(login.language);
        self.notifier.notify("ogagent/loggedin", payload).await
    }

    async fn on_logout(&self, username: &str) -> Result<(), ModuleError> {
        self.set_logged_in(None);
        self.notifier
            .notify("ogagent/loggedout", json!({ "user": username }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, Value)>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, endpoint: &str, payload: Value) -> Result<(), ModuleError> {
            self.0.lock().unwrap().push((endpoint.to_string(), payload));
            Ok(())
        }
    }

    struct FixedHost;

    impl Operations for FixedHost {
        fn os_type(&self) -> String {
            "Linux".into()
        }
        fn os_version(&self) -> String {
            "Ubuntu 24.04".into()
        }
        fn current_user(&self) -> Option<String> {
            None
        }
        fn session_language(&self) -> Option<String> {
            None
        }
        fn logoff(&self) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    fn reporter() -> (SessionReporter, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let module =
            SessionReporter::new(recorder.clone(), Arc::new(FixedHost), SessionBus::new());
        (module, recorder)
    }

    #[tokio::test]
    async fn lifecycle_reports() {
        let (module, recorder) = reporter();
        module.activate().await.unwrap();
        module
            .on_login(&LoginRequest::new("alice", "en"))
            .await
            .unwrap();
        assert_eq!(module.logged_in_user().as_deref(), Some("alice"));
        module.on_logout("alice").await.unwrap();
        assert_eq!(module.logged_in_user(), None);
        module.deactivate().await.unwrap();

        let seen = recorder.0.lock().unwrap();
        let endpoints: Vec<_> = seen.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            endpoints,
            [
                "ogagent/started",
                "ogagent/loggedin",
                "ogagent/loggedout",
                "ogagent/stopped"
            ]
        );
        assert_eq!(
            seen[0].1,
            json!({"ostype": "Linux", "osversion": "Ubuntu 24.04"})
        );
        assert_eq!(
            seen[1].1,
            json!({
                "ostype": "Linux",
                "osversion": "Ubuntu 24.04",
                "user": "alice",
                "language": "en"
            })
        );
        assert_eq!(seen[2].1, json!({"user": "alice"}));
    }

    #[tokio::test]
    async fn popup_done_is_forwarded() {
        let (module, recorder) = reporter();
        module
            .process("popup_done", json!({"id": 7}))
            .await
            .unwrap();
        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen[0], ("popup_done".to_string(), json!({"id": 7})));
    }

    #[tokio::test]
    async fn other_messages_are_unknown() {
        let (module, recorder) = reporter();
        let err = module.process("reboot", Value::Null).await.unwrap_err();
        assert!(matches!(err, ModuleError::UnknownMessage(m) if m == "reboot"));
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn relays_need_a_bound_bus() {
        let (module, _) = reporter();
        assert!(matches!(module.request_logoff(), Err(BusError::NotConnected)));
        assert!(matches!(
            module.show_popup("Aviso", "Hola"),
            Err(BusError::NotConnected)
        ));
        assert!(matches!(
            module.run_in_sessions("true"),
            Err(BusError::NotConnected)
        ));
    }
}
