// MIT License - Copyright (c) 2021 TJForc

//! The per-driver task.
//!
//! [`spawn_driver`] moves a driver onto its own task, which owns the
//! transport, the decoder and every unit. Callers hold a [`DriverHandle`]
//! and talk to the task over a request channel; each request carries a
//! oneshot for the reply, so all work for one driver is serialised.
//!
//! The task connects lazily: the first request that needs the device opens
//! the transport. A transport failure closes it, announces
//! [`DriverEvent::ConnectionLost`], and the next request reconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DriverConfig;
use crate::driver::{build_driver, Driver};
use crate::error::{LinkError, Result};
use crate::event::{event_channel, DriverEvent, EventReceiver, EventSender};
use crate::field::{CommResult, FieldDef, FieldId, FieldValue};
use crate::transport::{Connector, EndpointConnector, LinkStats};
use crate::units::Unit;

const REQUEST_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 256;

/// Connection state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Connecting,
    Polling,
}

/// Work marshaled onto the driver task.
#[derive(Debug)]
pub enum DriverRequest {
    Poll {
        reply: oneshot::Sender<Result<CommResult>>,
    },
    WriteField {
        field: FieldId,
        value: FieldValue,
        reply: oneshot::Sender<Result<CommResult>>,
    },
    RegisterFields {
        base: FieldId,
        reply: oneshot::Sender<Vec<FieldDef>>,
    },
    ConfigureUnit {
        unit: Unit,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<LinkStats>,
    },
    SaveUnits {
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable access to a running driver task.
#[derive(Clone)]
pub struct DriverHandle {
    requests: mpsc::Sender<DriverRequest>,
    events: EventSender,
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<DriverState>,
}

impl DriverHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> DriverRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .await
            .map_err(|_| LinkError::ChannelClosed)?;
        response.await.map_err(|_| LinkError::ChannelClosed)
    }

    /// One polling-engine tick. Device and transport failures come back as
    /// a [`CommResult`]; only usage errors are `Err`.
    pub async fn poll(&self) -> Result<CommResult> {
        self.request(|reply| DriverRequest::Poll { reply }).await?
    }

    pub async fn write_field(&self, field: FieldId, value: FieldValue) -> Result<CommResult> {
        self.request(|reply| DriverRequest::WriteField {
            field,
            value,
            reply,
        })
        .await?
    }

    pub async fn register_fields(&self, base: FieldId) -> Result<Vec<FieldDef>> {
        self.request(|reply| DriverRequest::RegisterFields { base, reply })
            .await
    }

    /// Applied between exchanges, never in the middle of one.
    pub async fn configure_unit(&self, unit: Unit) -> Result<()> {
        self.request(|reply| DriverRequest::ConfigureUnit { unit, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<LinkStats> {
        self.request(|reply| DriverRequest::Stats { reply }).await
    }

    /// Persisted unit records, for [`persist::decode_units`](crate::persist::decode_units).
    pub async fn save_units(&self) -> Result<Vec<u8>> {
        self.request(|reply| DriverRequest::SaveUnits { reply })
            .await?
    }

    /// Close the transport now. The next request reconnects.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| DriverRequest::Disconnect { reply })
            .await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Ask the task to stop. Waits in progress abort within one read tick.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Spawn the driver described by `config` on its own task.
pub fn spawn_driver(config: DriverConfig) -> (DriverHandle, JoinHandle<()>) {
    let (events, _) = event_channel(EVENT_QUEUE);
    let connector = Arc::new(EndpointConnector::new(
        config.endpoint.clone(),
        config.connect_timeout(),
    ));
    let driver = build_driver(config.clone(), events.clone());
    spawn_with(&config, driver, connector, events)
}

/// Spawn `driver`, opening transports through `connector`. Reconnect timing
/// comes from `config`.
pub fn spawn_with(
    config: &DriverConfig,
    driver: Box<dyn Driver>,
    connector: Arc<dyn Connector>,
    events: EventSender,
) -> (DriverHandle, JoinHandle<()>) {
    let (requests, inbox) = mpsc::channel(REQUEST_QUEUE);
    let (shutdown_tx, shutdown) = watch::channel(false);
    let (state_tx, state) = watch::channel(DriverState::Disconnected);

    let span = info_span!("driver", name = %driver.name());
    let worker = Worker {
        driver,
        connector,
        events: events.clone(),
        shutdown,
        state: state_tx,
        reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
        max_retries: config.max_connect_retries,
        failures: 0,
        retry_at: None,
    };
    let task = tokio::spawn(worker.run(inbox).instrument(span));

    let handle = DriverHandle {
        requests,
        events,
        shutdown: Arc::new(shutdown_tx),
        state,
    };
    (handle, task)
}

struct Worker {
    driver: Box<dyn Driver>,
    connector: Arc<dyn Connector>,
    events: EventSender,
    shutdown: watch::Receiver<bool>,
    state: watch::Sender<DriverState>,
    reconnect_delay: Duration,
    max_retries: u32,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut inbox: mpsc::Receiver<DriverRequest>) {
        info!("Driver task started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                request = inbox.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
            }
        }
        self.driver.disconnect().await;
        self.set_state(DriverState::Disconnected);
        info!("Driver task stopped");
    }

    fn set_state(&self, state: DriverState) {
        self.state.send_replace(state);
    }

    async fn handle(&mut self, request: DriverRequest) {
        match request {
            DriverRequest::Poll { reply } => {
                let result = match self.ensure_connected().await {
                    Ok(()) => {
                        let result = self.driver.poll().await;
                        self.settle(result).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(to_comm_result(result, "poll"));
            }
            DriverRequest::WriteField {
                field,
                value,
                reply,
            } => {
                // Writes for sleeping units queue without a connection
                if self.driver.write_needs_connection(field)
                    && let Err(e) = self.ensure_connected().await
                {
                    debug!("Writing field {} while disconnected: {}", field, e);
                }
                let result = self.driver.write_field(field, value).await;
                let result = self.settle(result).await;
                let _ = reply.send(to_comm_result(result, "write"));
            }
            DriverRequest::RegisterFields { base, reply } => {
                let _ = reply.send(self.driver.register_fields(base));
            }
            DriverRequest::ConfigureUnit { unit, reply } => {
                let _ = reply.send(self.driver.configure_unit(unit));
            }
            DriverRequest::Stats { reply } => {
                let _ = reply.send(self.driver.stats());
            }
            DriverRequest::SaveUnits { reply } => {
                let _ = reply.send(self.driver.save_units());
            }
            DriverRequest::Disconnect { reply } => {
                self.driver.disconnect().await;
                self.set_state(DriverState::Disconnected);
                let _ = reply.send(());
            }
        }
    }

    /// Open and handshake if not connected, retrying transient failures with
    /// exponential backoff. After a failed round, requests fail fast until
    /// the reconnect delay has passed.
    async fn ensure_connected(&mut self) -> Result<()> {
        if self.driver.is_connected() {
            return Ok(());
        }
        if let Some(at) = self.retry_at
            && Instant::now() < at
        {
            return Err(LinkError::Disconnected);
        }

        self.set_state(DriverState::Connecting);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.reconnect_delay * (1 << (attempt - 1).min(4));
                warn!(
                    "Connection attempt {} failed, retrying in {:.1}s...",
                    attempt,
                    delay.as_secs_f64()
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = self.shutdown.changed() => return Err(LinkError::Shutdown),
                }
            }

            let result = match self.connector.open().await {
                Ok(transport) => self.driver.connect(transport, self.shutdown.clone()).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.failures = 0;
                    self.retry_at = None;
                    self.set_state(DriverState::Polling);
                    let _ = self.events.send(DriverEvent::Connected);
                    info!("Connected");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Connection error (attempt {}): {}", attempt + 1, e);
                    let retry = e.is_retryable();
                    last_error = Some(e);
                    if !retry {
                        break;
                    }
                }
            }
        }

        self.failures += 1;
        let delay = self.reconnect_delay * (1 << (self.failures - 1).min(4));
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(DriverState::Disconnected);
        Err(last_error.unwrap_or(LinkError::Disconnected))
    }

    /// Close the transport after a fatal error so the next request starts
    /// from a fresh one.
    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && (e.is_transport_fatal() || matches!(e, LinkError::Shutdown))
            && self.driver.is_connected()
        {
            warn!("Connection lost: {}", e);
            self.driver.disconnect().await;
            self.set_state(DriverState::Disconnected);
            let _ = self.events.send(DriverEvent::ConnectionLost {
                reason: e.to_string(),
            });
        }
        result
    }
}

/// Usage errors stay errors; everything else becomes a field-engine result.
fn to_comm_result(result: Result<CommResult>, what: &str) -> Result<CommResult> {
    match result {
        Ok(result) => Ok(result),
        Err(e) if e.is_usage() => Err(e),
        Err(e) => {
            debug!("{} failed: {}", what, e);
            Ok(e.comm_result())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::{DriverKind, WaitPolicy};
    use crate::transport::Transport;

    struct Refusing {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for Refusing {
        async fn open(&self) -> Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(LinkError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    fn config(kind: DriverKind, reconnect_delay_ms: u64, retries: u32) -> DriverConfig {
        DriverConfig::builder()
            .name("test")
            .kind(kind)
            .reconnect_delay_ms(reconnect_delay_ms)
            .max_connect_retries(retries)
            .wait_policy(WaitPolicy {
                read_tick_ms: 10,
                ..WaitPolicy::default()
            })
            .build()
    }

    fn spawn_refusing(
        kind: DriverKind,
        reconnect_delay_ms: u64,
        retries: u32,
    ) -> (DriverHandle, JoinHandle<()>, Arc<Refusing>) {
        let config = config(kind, reconnect_delay_ms, retries);
        let (events, _) = event_channel(16);
        let connector = Arc::new(Refusing {
            attempts: AtomicUsize::new(0),
        });
        let driver = build_driver(config.clone(), events.clone());
        let (handle, task) = spawn_with(&config, driver, connector.clone(), events);
        (handle, task, connector)
    }

    #[tokio::test]
    async fn test_refused_connect_reports_lost_connection() {
        let (handle, task, connector) = spawn_refusing(DriverKind::Zwave, 200, 1);
        assert_eq!(handle.poll().await.unwrap(), CommResult::LostConnection);
        // One retry after the first attempt
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handle.state(), DriverState::Disconnected);

        // Inside the backoff window nothing is attempted
        assert_eq!(handle.poll().await.unwrap(), CommResult::LostConnection);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_usage_errors_are_not_swallowed() {
        let (handle, task, _connector) = spawn_refusing(DriverKind::Redrat, 10_000, 0);
        let err = handle.configure_unit(Unit::new(3, "Lamp")).await.unwrap_err();
        assert!(err.is_usage());

        let defs = handle.register_fields(1).await.unwrap();
        assert_eq!(defs.len(), 4);
        assert_eq!(handle.stats().await.unwrap(), LinkStats::default());

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(handle.poll().await, Err(LinkError::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_queue_while_disconnected() {
        // Default backoff would sleep 5 + 10 + 20 s before giving up
        let (handle, task, connector) = spawn_refusing(DriverKind::Zwave, 5000, 3);
        let mut unit = Unit::new(9, "Door");
        let mut info = crate::units::device_info::DeviceCatalog::builtin()
            .get("dimmer")
            .unwrap()
            .clone();
        info.wakeup = true;
        unit.apply_device_info(&info);
        handle.configure_unit(unit).await.unwrap();
        handle.register_fields(1).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(
            handle.write_field(1, FieldValue::Card(20)).await.unwrap(),
            CommResult::Success
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        // Anything else still goes through the connect path
        assert_eq!(
            handle.write_field(7, FieldValue::Card(20)).await.unwrap(),
            CommResult::Failed
        );
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        handle.shutdown();
        task.await.unwrap();
    }
}
