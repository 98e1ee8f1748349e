//! A bounded thread pool running one closure over a stream of inputs.
//!
//! Used for the blob transfer work on the node side: the cooperative
//! HTTP tasks must not block, so hashing and object store I/O run here.
//! If one handler returns an error the pool is marked aborted and no
//! further input is accepted; `complete()` surfaces the first error.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Sender};

/// Cloneable handle to feed input to the workers.
pub struct SendHandle<I> {
    input: Sender<I>,
    abort: Arc<Mutex<Option<String>>>,
}

impl<I: Send> SendHandle<I> {
    pub fn send(&self, input: I) -> Result<(), Error> {
        check_abort(&self.abort)?;
        if self.input.send(input).is_err() {
            bail!("send failed - channel closed");
        }
        Ok(())
    }
}

impl<I> Clone for SendHandle<I> {
    fn clone(&self) -> Self {
        Self {
            input: self.input.clone(),
            abort: Arc::clone(&self.abort),
        }
    }
}

fn check_abort(abort: &Mutex<Option<String>>) -> Result<(), Error> {
    if let Some(message) = &*abort.lock().unwrap() {
        return Err(format_err!("{}", message));
    }
    Ok(())
}

pub struct ParallelHandler<I> {
    handles: Vec<JoinHandle<()>>,
    name: String,
    input: Option<SendHandle<I>>,
}

impl<I: Send + 'static> ParallelHandler<I> {
    /// Spawn `threads` workers, each processing inputs with `handler_fn`.
    pub fn new<F>(name: &str, threads: usize, handler_fn: F) -> Self
    where
        F: Fn(I) -> Result<(), Error> + Send + Clone + 'static,
    {
        let (input_tx, input_rx) = bounded::<I>(threads);
        let abort = Arc::new(Mutex::new(None));

        let mut handles = Vec::new();
        for i in 0..threads {
            let input_rx = input_rx.clone();
            let abort = Arc::clone(&abort);
            let handler_fn = handler_fn.clone();

            handles.push(
                std::thread::Builder::new()
                    .name(format!("{} ({})", name, i))
                    .spawn(move || loop {
                        let input = match input_rx.recv() {
                            Ok(input) => input,
                            Err(_) => return,
                        };
                        if let Err(err) = handler_fn(input) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err.to_string());
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        Self {
            handles,
            name: name.to_string(),
            input: Some(SendHandle {
                input: input_tx,
                abort,
            }),
        }
    }

    pub fn channel(&self) -> SendHandle<I> {
        self.input.as_ref().unwrap().clone()
    }

    pub fn send(&self, input: I) -> Result<(), Error> {
        self.input.as_ref().unwrap().send(input)
    }

    /// Close the channel, wait for the workers and report the first
    /// error, if any.
    pub fn complete(mut self) -> Result<(), Error> {
        let input = self.input.take().unwrap();
        let abort = Arc::clone(&input.abort);
        check_abort(&abort)?;
        drop(input);

        let panics = self.join_threads();
        check_abort(&abort)?;
        if !panics.is_empty() {
            return Err(format_err!("{}", panics.join("\n")));
        }
        Ok(())
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        while let Some(handle) = self.handles.pop() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(message) => {
                        messages.push(format!("worker {} panicked: {}", self.name, message))
                    }
                    Err(_) => messages.push(format!("worker {} panicked", self.name)),
                }
            }
        }
        messages
    }
}

// joining on drop keeps late workers from outliving the operation
impl<I> Drop for ParallelHandler<I> {
    fn drop(&mut self) {
        drop(self.input.take());
        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}
