use axum::Router;
use std::sync::Arc;

use crate::db::Database;
use crate::events::EventBus;
use crate::scheduler::Scheduler;
use crate::tasks::TaskManager;

pub mod tasks;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<Database>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskManager>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: ApiState) -> Router {
    Router::new().nest("/tasks", tasks::router(state))
}
