//! Engine builder

use std::sync::Arc;

use tokio::sync::mpsc;

use super::actuation::ActuationWorker;
use super::{EngineHandle, EngineStats, LinkEngine};
use crate::call::CallStateCoordinator;
use crate::config::LinkConfig;
use crate::connection::ConnectionManager;
use crate::device::{CallActuator, StaticTelemetry, TelemetrySource};
use crate::error::{LinkError, LinkResult};
use crate::pending::PendingRequestTracker;
use crate::transport::Connector;

/// Assembles a [`LinkEngine`] and its first [`EngineHandle`]
///
/// Only the actuator is mandatory. Without a connector, `REST_API` mode gets
/// the polling REST connector and every other mode the WebSocket one, when
/// the matching feature is on. Without a telemetry source the engine reports
/// default values.
pub struct LinkEngineBuilder {
    config: LinkConfig,
    connector: Option<Arc<dyn Connector>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    actuator: Option<Arc<dyn CallActuator>>,
}

impl LinkEngineBuilder {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            connector: None,
            telemetry: None,
            actuator: None,
        }
    }

    /// Transport used to reach the server
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Platform side that performs calls, tones and playback
    pub fn actuator(mut self, actuator: Arc<dyn CallActuator>) -> Self {
        self.actuator = Some(actuator);
        self
    }

    /// Validate the configuration and wire the engine together
    ///
    /// Missing server address or device id is not an error here; the engine
    /// reports it through the connection state when asked to connect.
    pub fn build(self) -> LinkResult<(LinkEngine, EngineHandle)> {
        self.config.validate()?;

        let actuator = self.actuator.ok_or_else(|| LinkError::MissingConfiguration {
            field: "actuator".to_string(),
        })?;
        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector(&self.config)?,
        };
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(StaticTelemetry::new(Default::default())));

        let (events_tx, events_rx) = mpsc::channel(self.config.event_queue_capacity);
        let stats = Arc::new(EngineStats::default());
        let pending = Arc::new(PendingRequestTracker::new(self.config.request_timeout()));

        let connection = ConnectionManager::new(
            self.config.clone(),
            connector,
            telemetry.clone(),
            events_tx.clone(),
            stats.clone(),
        );
        let handle = EngineHandle::new(events_tx.clone(), pending.clone(), stats.clone(), connection.subscribe());

        let engine = LinkEngine {
            config: self.config,
            connection,
            coordinator: CallStateCoordinator::new(),
            telemetry,
            pending,
            stats,
            actuations: ActuationWorker::new(actuator),
            events_tx,
            events_rx,
            restart_timer: None,
        };
        Ok((engine, handle))
    }
}

fn default_connector(config: &LinkConfig) -> LinkResult<Arc<dyn Connector>> {
    if config.is_rest_mode() {
        return rest_connector(config);
    }
    websocket_connector()
}

#[cfg(feature = "rest")]
fn rest_connector(config: &LinkConfig) -> LinkResult<Arc<dyn Connector>> {
    let connector = crate::transport::RestConnector::new()?.with_poll_interval(config.poll_interval());
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "rest"))]
fn rest_connector(_config: &LinkConfig) -> LinkResult<Arc<dyn Connector>> {
    Err(LinkError::MissingConfiguration {
        field: "connector".to_string(),
    })
}

#[cfg(feature = "ws")]
fn websocket_connector() -> LinkResult<Arc<dyn Connector>> {
    Ok(Arc::new(crate::transport::WebSocketConnector::new()))
}

#[cfg(not(feature = "ws"))]
fn websocket_connector() -> LinkResult<Arc<dyn Connector>> {
    Err(LinkError::MissingConfiguration {
        field: "connector".to_string(),
    })
}
