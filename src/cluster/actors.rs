use std::{
    sync::mpsc,
    thread::{self, JoinHandle},
};

use actix::{Actor, Addr, Context, System};
use actix_rt::ArbiterHandle;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::error::{BackendError, Result};

/// Hosts an actix system on a dedicated thread so that stateful actors can be
/// created and addressed from any thread or async runtime.
pub struct ActorHost {
    system: System,
    arbiter: ArbiterHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ActorHost {
    /// Boots the actor system on its own thread.
    ///
    /// # Returns
    /// A running `ActorHost` or an error if the system thread couldn't start.
    pub fn start() -> Result<Self> {
        let (tx, rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("actor-host".into())
            .spawn(move || {
                let runner = System::new();
                let system = System::current();
                let arbiter = system.arbiter().clone();

                if tx.send((system, arbiter)).is_err() {
                    return;
                }

                if let Err(e) = runner.run() {
                    error!("actor system exited with error: {e}");
                }
                debug!("actor system stopped");
            })?;

        let (system, arbiter) = rx
            .recv()
            .map_err(|_| BackendError::Actor("actor system failed to boot".into()))?;

        info!("actor host started");
        Ok(Self {
            system,
            arbiter,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Starts an actor on the host's arbiter.
    ///
    /// # Args
    /// * `factory` - Builds the actor inside the actor system's thread.
    ///
    /// # Returns
    /// The address of the new actor.
    pub fn spawn<A, F>(&self, factory: F) -> Addr<A>
    where
        A: Actor<Context = Context<A>>,
        F: FnOnce(&mut Context<A>) -> A + Send + 'static,
    {
        A::start_in_arbiter(&self.arbiter, factory)
    }

    /// Whether the actor system still runs.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Stops the actor system and every actor on it, waits for the system thread to exit.
    /// Calling it more than once is a no-op.
    pub fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };

        self.system.stop();
        if thread.join().is_err() {
            error!("actor host thread panicked");
        }
        info!("actor host stopped");
    }
}

impl Drop for ActorHost {
    fn drop(&mut self) {
        self.stop();
    }
}
