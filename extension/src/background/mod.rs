// Background context
// Owns the privileged side of the wallet: the API dispatcher, the
// authorization controller and the event broadcaster. Everything is
// registered in `init` and removed again in `teardown`.

pub mod dispatcher;
pub mod events;
pub mod modules;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::auth::{AuthController, AuthSettings};
use crate::bus::{BusError, Destination, Endpoint, MessageBus, TabId, MAIN_FRAME};
use crate::protocol::channels;
use crate::services::{ActivityLog, Browser, Gateway, Keystore, PermissionStore};

pub use dispatcher::{DispatchError, Dispatcher};
pub use events::EventBroadcaster;
pub use modules::ModuleContext;

/// External collaborators the background works with
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn PermissionStore>,
    pub keystore: Arc<dyn Keystore>,
    pub gateway: Arc<dyn Gateway>,
    pub browser: Arc<dyn Browser>,
    pub activity: Arc<dyn ActivityLog>,
}

pub struct Background {
    endpoint: Arc<Endpoint>,
    dispatcher: Arc<Dispatcher>,
    auth: Arc<AuthController>,
    events: Arc<EventBroadcaster>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Background {
    /// Attach the background to the bus and register all of its handlers
    pub fn init(bus: &Arc<MessageBus>, services: Services, settings: AuthSettings) -> Result<Self, BusError> {
        let endpoint = Arc::new(bus.attach(Destination::Background)?);

        let auth = AuthController::new(endpoint.clone(), services.browser.clone(), settings);
        let mut tasks = vec![auth.init()];

        let dispatcher = Arc::new(Dispatcher::new(services.clone(), auth.clone()));
        dispatcher.register(&endpoint);

        let events = Arc::new(EventBroadcaster::new(endpoint.clone(), services));
        tasks.push(events.clone().watch_store());
        tasks.push(events.clone().watch_keystore());

        tracing::info!("Background initialized");

        Ok(Self {
            endpoint,
            dispatcher,
            auth,
            events,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn auth(&self) -> &Arc<AuthController> {
        &self.auth
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    /// Ask the content script of a tab to copy an address to the clipboard
    pub async fn copy_address(&self, tab_id: TabId, address: &str) -> Result<(), BusError> {
        self.endpoint
            .send(
                channels::COPY_ADDRESS,
                &json!({ "address": address }),
                Destination::ContentScript {
                    tab_id,
                    frame_id: MAIN_FRAME,
                },
            )
            .await
            .map(|_| ())
    }

    /// Remove every handler and stop the watcher tasks
    pub fn teardown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.endpoint.detach();
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        self.teardown();
    }
}
