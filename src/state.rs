use std::sync::Arc;

use crate::repository::TaskRepository;
use crate::store::RemoteStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RemoteStore>,
    pub repo: TaskRepository,
}

impl AppState {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            repo: TaskRepository::new(store.clone()),
            store,
        }
    }
}
