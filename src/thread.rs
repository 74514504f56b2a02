//! Pairing of a worker thread with its reactor.

use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::reactor::{Controller, Reactor};

/// Hook run on a fresh reactor thread before it starts looping.
pub type ThreadInitCallback = Arc<dyn Fn(&Rc<Reactor>) + Send + Sync>;

/// Owns one worker thread running one reactor. Starting the thread boots the
/// reactor and hands its [`Controller`] back once the loop is about to enter
/// service; dropping quits the loop and joins the thread.
pub struct ReactorThread {
    name: String,
    init: Option<ThreadInitCallback>,
    thread: Option<JoinHandle<()>>,
    controller: Option<Controller>,
}

impl ReactorThread {
    pub fn new(name: String, init: Option<ThreadInitCallback>) -> Self {
        ReactorThread {
            name,
            init,
            thread: None,
            controller: None,
        }
    }

    /// Spawns the worker, waits for its reactor to come up, and returns the
    /// reactor's controller.
    pub fn start(&mut self) -> Controller {
        assert!(self.thread.is_none());
        let (handover_send, handover_recv) = chan::bounded::<Controller>(1);
        let init = self.init.clone();

        log::debug!(target: "reactor", "Starting reactor thread `{}`", self.name);
        let thread = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let reactor = Reactor::new();
                if let Some(init) = &init {
                    init(&reactor);
                }
                handover_send
                    .send(reactor.controller())
                    .expect("reactor startup channel is broken");
                reactor.run();
            })
            .expect("failed to spawn reactor thread");

        let controller = handover_recv
            .recv()
            .expect("reactor thread died during startup");
        self.thread = Some(thread);
        self.controller = Some(controller.clone());
        controller
    }

    pub fn controller(&self) -> Option<&Controller> { self.controller.as_ref() }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.quit();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!(target: "reactor", "Reactor thread `{}` panicked", self.name);
            }
        }
    }
}
