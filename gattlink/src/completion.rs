use std::fmt;

use log::debug;

/// Delivers the result of an operation to its callback exactly once.
///
/// If a `Completion` is dropped without [`complete`](Completion::complete)
/// having been called (the operation returned early, panicked, or its task
/// was aborted) the callback receives `T::default()`, which for every
/// operation is its failure sentinel.
pub struct Completion<T: Default> {
    operation: &'static str,
    callback: Option<Box<dyn FnOnce(T) + Send>>,
}

impl<T: Default> Completion<T> {
    pub fn new<F>(operation: &'static str, callback: F) -> Self
        where F: FnOnce(T) + Send + 'static
    {
        Completion {
            operation,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn complete(mut self, value: T) {
        if let Some(callback) = self.callback.take() {
            callback(value);
        }
    }
}

impl<T: Default> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("operation", &self.operation)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

impl<T: Default> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            debug!("{}: abandoned, completing with failure", self.operation);
            callback(T::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl FnOnce(T) + Send + 'static) {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        (seen, move |value| sink.lock().unwrap().push(value))
    }

    #[test]
    fn completes_once() {
        let (seen, callback) = recorder::<bool>();
        Completion::new("write", callback).complete(true);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn dropping_delivers_default() {
        crate::init_test_logging();
        let (seen, callback) = recorder::<Option<Vec<u8>>>();
        drop(Completion::new("read", callback));
        assert_eq!(*seen.lock().unwrap(), vec![None]);
    }
}
