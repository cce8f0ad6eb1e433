use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::{fmt, io};

use tracing::{error, warn};

/// Thread handle that joins the thread when dropped
pub struct AutoJoinHandle {
    pub(crate) join_handle: Option<JoinHandle<()>>,
}

impl AutoJoinHandle {
    /// Spawn a named thread running `f`, logging the error it might return
    pub fn spawn_res<F, E>(name: &str, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        F: Send + 'static,
        E: Send + fmt::Display + 'static,
    {
        let thread_name = name.to_owned();
        let join_handle = thread::Builder::new().name(name.to_owned()).spawn(move || {
            if let Err(e) = f() {
                error!(thread = %thread_name, error = %e, "Task failed");
            }
        })?;
        Ok(Self::from(join_handle))
    }
}

impl From<JoinHandle<()>> for AutoJoinHandle {
    fn from(value: JoinHandle<()>) -> Self {
        Self {
            join_handle: Some(value),
        }
    }
}

impl Drop for AutoJoinHandle {
    fn drop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() && !thread::panicking() {
                panic!("Task thread panicked");
            }
        }
    }
}

/// Stops the whole node if the task holding it panics
pub struct PanicGuard {
    name: &'static str,
    flag: Arc<AtomicBool>,
    done: bool,
}

impl PanicGuard {
    pub fn new(name: &'static str, flag: Arc<AtomicBool>) -> Self {
        Self {
            name,
            flag,
            done: false,
        }
    }

    pub fn done(mut self) {
        self.done = true;
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if !self.done {
            warn!("Task {} panic detected via PanicGuard", self.name);
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn panic_guard_raises_flag_unless_done() {
    let flag = Arc::new(AtomicBool::new(false));
    PanicGuard::new("ok", flag.clone()).done();
    assert!(!flag.load(Ordering::SeqCst));

    let res = thread::spawn({
        let flag = flag.clone();
        move || {
            let _guard = PanicGuard::new("panicky", flag);
            panic!("boom");
        }
    })
    .join();
    assert!(res.is_err());
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn auto_join_handle_waits_for_thread() {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = AutoJoinHandle::spawn_res("setter", {
        let flag = flag.clone();
        move || -> Result<(), io::Error> {
            thread::sleep(std::time::Duration::from_millis(10));
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();
    drop(handle);
    assert!(flag.load(Ordering::SeqCst));
}
