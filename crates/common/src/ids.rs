//! Identifier generation for control-plane records

use uuid::Uuid;

/// Eight lowercase hex characters taken from a random UUID
pub fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// New workspace id, e.g. `ws-1a2b3c4d`
pub fn workspace_id() -> String {
    format!("ws-{}", short_id())
}

/// New function id, e.g. `fn-1a2b3c4d`
pub fn function_id() -> String {
    format!("fn-{}", short_id())
}

/// New execution log id
pub fn log_id() -> String {
    short_id()
}

/// New build task id (full UUID)
pub fn task_id() -> String {
    Uuid::new_v4().to_string()
}

/// Application name used when a submission does not name one
pub fn app_name() -> String {
    format!("app-{}", short_id())
}
