//! Mailbox actors.
//!
//! Each long-lived component of the engine (Replicator, Pusher, Puller,
//! RevFinder, Inserter) owns its state on a dedicated thread and processes
//! one enqueued task at a time. State crosses actor boundaries only by
//! enqueuing tasks onto another actor's mailbox; there are no direct
//! cross-actor calls.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;
use tracing::{error, trace};

enum Envelope<S> {
    Task(Box<dyn FnOnce(&mut S) + Send>),
    Stop,
}

/// A cloneable enqueue handle onto an actor's mailbox.
pub struct ActorRef<S> {
    name: &'static str,
    tx: Sender<Envelope<S>>,
}

impl<S> Clone for ActorRef<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> ActorRef<S> {
    /// Enqueues a task; it runs on the actor's thread, alone.
    ///
    /// Sends to a stopped actor are dropped: by then nobody is interested
    /// in the result.
    pub fn enqueue(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        if self.tx.send(Envelope::Task(Box::new(task))).is_err() {
            trace!(actor = self.name, "task dropped; actor is stopped");
        }
    }

    /// Enqueues a task after a delay.
    pub fn enqueue_after(&self, delay: Duration, task: impl FnOnce(&mut S) + Send + 'static) {
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            let _ = tx.send(Envelope::Task(Box::new(task)));
        });
    }

    /// Stops the actor after the tasks already queued have run.
    pub fn stop(&self) {
        let _ = self.tx.send(Envelope::Stop);
    }
}

/// An actor mailbox not yet running.
///
/// Created together with its [`ActorRef`] so that mutually-referencing
/// actors can be wired up before any of them starts.
pub struct Mailbox<S> {
    name: &'static str,
    rx: Receiver<Envelope<S>>,
}

impl<S: Send + 'static> Mailbox<S> {
    /// Creates a mailbox and its enqueue handle.
    pub fn new(name: &'static str) -> (ActorRef<S>, Mailbox<S>) {
        let (tx, rx) = mpsc::channel();
        (ActorRef { name, tx }, Mailbox { name, rx })
    }

    /// Spawns the actor thread, which owns `state` and drains the mailbox
    /// until stopped (or until every `ActorRef` is dropped).
    ///
    /// A panicking task is contained: it is logged and the actor keeps
    /// running.
    pub fn run(self, mut state: S) {
        let name = self.name;
        let builder = thread::Builder::new().name(name.to_string());
        let spawned = builder.spawn(move || {
            while let Ok(envelope) = self.rx.recv() {
                match envelope {
                    Envelope::Task(task) => {
                        let result = catch_unwind(AssertUnwindSafe(|| task(&mut state)));
                        if result.is_err() {
                            error!(actor = name, "handler panicked; actor continues");
                        }
                    }
                    Envelope::Stop => break,
                }
            }
        });
        if let Err(e) = spawned {
            error!(actor = name, "failed to spawn actor thread: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    struct Counter {
        count: u64,
        report: mpsc::Sender<u64>,
    }

    #[test]
    fn tasks_run_in_order() {
        let (tx, rx) = mpsc::channel();
        let (actor, mailbox) = Mailbox::new("counter");
        mailbox.run(Counter { count: 0, report: tx });

        for _ in 0..5 {
            actor.enqueue(|c: &mut Counter| {
                c.count += 1;
                c.report.send(c.count).unwrap();
            });
        }

        let seen: Vec<u64> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn enqueue_after_delays() {
        let (tx, rx) = mpsc::channel();
        let (actor, mailbox) = Mailbox::new("timer");
        mailbox.run(Counter { count: 0, report: tx });

        let start = Instant::now();
        actor.enqueue_after(Duration::from_millis(30), |c: &mut Counter| {
            c.report.send(1).unwrap();
        });
        rx.recv().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn panic_does_not_kill_actor() {
        let (tx, rx) = mpsc::channel();
        let (actor, mailbox) = Mailbox::new("panicky");
        mailbox.run(Counter { count: 0, report: tx });

        actor.enqueue(|_: &mut Counter| panic!("boom"));
        actor.enqueue(|c: &mut Counter| {
            c.report.send(42).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn stop_halts_processing() {
        let (tx, rx) = mpsc::channel();
        let (actor, mailbox) = Mailbox::new("stopper");
        mailbox.run(Counter { count: 0, report: tx });

        actor.stop();
        actor.enqueue(|c: &mut Counter| {
            c.report.send(1).unwrap();
        });
        assert!(rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
    }
}
