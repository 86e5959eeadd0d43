use std::sync::Arc;

use tokio::sync::Mutex;

type SinkStore<E> = Arc<Mutex<Vec<Box<dyn Fn(&E) + Send + Sync>>>>;

/// Fan-out of events to registered sinks.
///
/// The subscriber list is append-only for the lifetime of the hub and
/// delivery is synchronous: every sink observes every event, in
/// publication order, before `notify` returns.
pub struct EventHub<E> {
    sinks: SinkStore<E>,
}

impl<E> EventHub<E> {
    pub fn new() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn subscribe<F: Fn(&E) + Send + Sync + 'static>(&self, sink: F) {
        self.sinks.lock().await.push(Box::new(sink));
    }

    pub async fn notify(&self, event: &E) {
        let sinks = self.sinks.lock().await;
        for sink in sinks.iter() {
            sink(event);
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            sinks: self.sinks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn test_sinks_see_events_in_publication_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for _ in 0..2 {
            let seen = seen.clone();
            hub.subscribe(move |e: &u32| seen.lock().unwrap().push(*e))
                .await;
        }

        for i in 0..4 {
            hub.notify(&i).await;
        }

        // Both sinks, same sequence, interleaved per event.
        assert_eq!(*seen.lock().unwrap(), vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let hub = EventHub::<&'static str>::new();
        hub.notify(&"early").await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            hub.subscribe(move |e: &&str| seen.lock().unwrap().push(*e))
                .await;
        }
        hub.notify(&"late").await;

        assert_eq!(*seen.lock().unwrap(), vec!["late"]);
    }
}
