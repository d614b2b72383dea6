//! thread pool module.

use std::io;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};

enum Message {
    NewJob(Job),
    Terminate,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads fed through a channel.
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: mpsc::Sender<Message>,
}

impl ThreadPool {
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "thread pool needs at least one worker",
            ));
        }

        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(Worker::new(id, Arc::clone(&receiver))?);
        }

        Ok(Self { workers, sender })
    }

    /// Queue `f` for the next idle worker.
    pub fn execute<F>(&self, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Message::NewJob(Box::new(f)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "all workers are gone"))
    }
}

impl Drop for ThreadPool {
    /// Let queued jobs finish, then stop every worker.
    fn drop(&mut self) {
        info!("Sending termination message to all workers.");
        for _ in &self.workers {
            if self.sender.send(Message::Terminate).is_err() {
                break;
            }
        }

        info!("Shutting down all workers...");
        for worker in &mut self.workers {
            debug!("Shutting down worker {}", worker.id);

            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("worker {} panicked", worker.id);
                }
            }
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Message>>>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("segdb-worker-{}", id))
            .spawn(move || loop {
                let message = match receiver.lock() {
                    Ok(rx) => rx.recv(),
                    Err(_) => {
                        error!("Worker {id}: job queue lock poisoned");
                        break;
                    }
                };

                match message {
                    Ok(Message::NewJob(job)) => {
                        debug!("Worker: {id} got a job; executing.");

                        job();
                    }
                    Ok(Message::Terminate) | Err(_) => {
                        warn!("Worker {id} was told to terminate.");

                        break;
                    }
                }
            })?;

        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }
}
