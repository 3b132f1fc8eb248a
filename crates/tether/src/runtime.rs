use std::future::Future;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

// Heartbeats and peer callbacks run here so a busy caller runtime cannot starve them.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("tether-background")
        .enable_all()
        .build()
        .expect("tokio runtime")
});

pub fn background_handle() -> Handle {
    RUNTIME.handle().clone()
}

/// Spawn on `handle` when given, else on the caller's runtime, else on the background one.
pub fn spawn_with_handle<F>(handle: Option<&Handle>, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match handle {
        Some(handle) => handle.spawn(future),
        None => match Handle::try_current() {
            Ok(current) => current.spawn(future),
            Err(_) => RUNTIME.spawn(future),
        },
    }
}
