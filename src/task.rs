use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// A background loop that keeps running until cancelled or the process exits.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Starting {name} task");
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn cancel(&self) {
        debug!("Cancelling {} task", self.name);
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_loop() {
        let task = TaskHandle::spawn("forever", async {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        assert_eq!(task.name(), "forever");

        task.cancel();
        for _ in 0..10 {
            if task.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(task.is_finished());
    }
}
