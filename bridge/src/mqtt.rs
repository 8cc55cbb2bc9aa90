use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const MAX_MQTT_PAYLOAD_BYTES: usize = 8 * 1024;
const ROUTE_QUEUE_DEPTH: usize = 16;

/// Shared MQTT client that fans incoming publishes out to per-device queues.
#[derive(Clone)]
pub struct MqttHub {
    client: AsyncClient,
    routes: Arc<Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>>,
    connected: Arc<AtomicBool>,
}

impl MqttHub {
    pub fn new(options: MqttOptions) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(options, 64);
        let hub = Self {
            client,
            routes: Arc::new(Mutex::new(HashMap::new())),
            connected: Arc::new(AtomicBool::new(false)),
        };
        (hub, eventloop)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Polls until `timeout` for the broker connection to come up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        true
    }

    /// Subscribes to `topics` and returns one queue receiving all of them.
    pub async fn subscribe(
        &self,
        topics: &[String],
    ) -> Result<mpsc::Receiver<Vec<u8>>, ClientError> {
        let (tx, rx) = mpsc::channel(ROUTE_QUEUE_DEPTH);
        {
            let mut routes = self.routes.lock().await;
            for topic in topics {
                routes.insert(topic.clone(), tx.clone());
            }
        }

        for topic in topics {
            debug!(%topic, "listening for mqtt topic");
            self.client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
        }
        Ok(rx)
    }

    pub async fn unsubscribe(&self, topics: &[String]) {
        {
            let mut routes = self.routes.lock().await;
            for topic in topics {
                routes.remove(topic);
            }
        }

        for topic in topics {
            if let Err(err) = self.client.unsubscribe(topic.as_str()).await {
                warn!("mqtt unsubscribe from {topic} failed: {err}");
            }
        }
    }

    /// Hands a publish to whoever subscribed to its topic. Returns whether
    /// anyone was listening.
    pub async fn dispatch(&self, topic: &str, payload: Vec<u8>) -> bool {
        if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
            warn!(
                "dropping oversized MQTT payload on topic {} ({} bytes)",
                topic,
                payload.len()
            );
            return false;
        }

        let route = self.routes.lock().await.get(topic).cloned();
        let Some(route) = route else {
            return false;
        };
        if route.try_send(payload).is_err() {
            warn!("mqtt queue for {topic} is full or closed, dropping payload");
            return false;
        }
        true
    }

    async fn resubscribe(&self) {
        let topics: Vec<String> = self.routes.lock().await.keys().cloned().collect();
        for topic in topics {
            if let Err(err) = self.client.subscribe(topic.as_str(), QoS::AtMostOnce).await {
                warn!("mqtt resubscribe to {topic} failed: {err}");
            }
        }
    }

    pub fn spawn_event_loop(&self, mut eventloop: EventLoop) {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        hub.dispatch(&message.topic, message.payload.to_vec()).await;
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        hub.connected.store(true, Ordering::Relaxed);
                        hub.resubscribe().await;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        hub.connected.store(false, Ordering::Relaxed);
                        warn!("mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> (MqttHub, EventLoop) {
        MqttHub::new(MqttOptions::new("smart-maic-test", "127.0.0.1", 1883))
    }

    #[tokio::test]
    async fn publishes_reach_subscribed_queue_only() {
        let (hub, _eventloop) = hub();
        let topics = vec!["smart-maic/dev1/JSON".to_string(), "dev1/JSON".to_string()];
        let mut rx = hub.subscribe(&topics).await.unwrap();

        assert!(hub.dispatch("dev1/JSON", b"{\"V\":1}".to_vec()).await);
        assert!(hub.dispatch("smart-maic/dev1/JSON", b"{}".to_vec()).await);
        assert!(!hub.dispatch("dev2/JSON", b"{}".to_vec()).await);

        assert_eq!(rx.recv().await.unwrap(), b"{\"V\":1}".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"{}".to_vec());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (hub, _eventloop) = hub();
        let topics = vec!["dev1/JSON".to_string()];
        let _rx = hub.subscribe(&topics).await.unwrap();

        hub.unsubscribe(&topics).await;
        assert!(!hub.dispatch("dev1/JSON", b"{}".to_vec()).await);
    }

    #[tokio::test]
    async fn oversized_payloads_are_dropped() {
        let (hub, _eventloop) = hub();
        let topics = vec!["dev1/JSON".to_string()];
        let _rx = hub.subscribe(&topics).await.unwrap();

        assert!(!hub.dispatch("dev1/JSON", vec![b' '; MAX_MQTT_PAYLOAD_BYTES + 1]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_connected_gives_up_after_timeout() {
        let (hub, _eventloop) = hub();
        assert!(!hub.wait_connected(Duration::from_secs(1)).await);

        hub.set_connected(true);
        assert!(hub.wait_connected(Duration::from_secs(1)).await);
    }
}
