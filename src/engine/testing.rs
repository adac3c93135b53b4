//! Test doubles for drivers, handles and tunnels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::ssh_tunnel::{LocalEndpoint, TunnelProvider, TunnelRequest};
use crate::engine::traits::{ClientHandle, DataEngine, Driver};
use crate::engine::types::{
    BackendKind, ConnectionId, DataModel, DataRequest, DialTarget, QueryConfig, TabularResult,
    Value,
};

/// Handle answering every call with an empty result.
pub struct StubEngine {
    pub backend: BackendKind,
    pub closed: AtomicUsize,
    pub queries: Mutex<Vec<String>>,
}

impl StubEngine {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            closed: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataEngine for StubEngine {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    async fn test_connection(&self, config: &QueryConfig) -> EngineResult<()> {
        config.guard(async { Ok(()) }).await
    }

    async fn run_query(&self, query: &str, config: &QueryConfig) -> EngineResult<TabularResult> {
        if config.read_only && query.trim_start().to_ascii_lowercase().starts_with("delete") {
            return Err(EngineError::read_only_violation("DELETE"));
        }
        config
            .guard(async {
                self.queries.lock().unwrap().push(query.to_string());
                Ok(())
            })
            .await?;
        config.audit(query);
        Ok(TabularResult::scalars([("query", Value::Text(query.to_string()))]))
    }

    async fn get_data_models(&self, _config: &QueryConfig) -> EngineResult<Vec<DataModel>> {
        Ok(vec![DataModel {
            name: "users".into(),
            ..DataModel::default()
        }])
    }

    async fn get_single_data_model(
        &self,
        schema: &str,
        name: &str,
        _config: &QueryConfig,
    ) -> EngineResult<DataModel> {
        Ok(DataModel {
            name: name.to_string(),
            schema_name: schema.to_string(),
            ..DataModel::default()
        })
    }

    async fn get_data(
        &self,
        _request: &DataRequest,
        _config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        Ok(TabularResult::empty())
    }

    async fn add_row(
        &self,
        _schema: &str,
        _name: &str,
        _row: &JsonMap<String, JsonValue>,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        if config.read_only {
            return Err(EngineError::read_only_violation("insert"));
        }
        Ok(TabularResult::empty())
    }

    async fn delete_rows(
        &self,
        _schema: &str,
        _name: &str,
        ids: &[String],
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        if config.read_only {
            return Err(EngineError::read_only_violation("delete"));
        }
        Ok(TabularResult::scalars([(
            "deletedCount",
            Value::Int(ids.len() as i64),
        )]))
    }

    async fn update_single_cell(
        &self,
        _schema: &str,
        _name: &str,
        _id: &str,
        _column: &str,
        _value: &str,
        config: &QueryConfig,
    ) -> EngineResult<TabularResult> {
        if config.read_only {
            return Err(EngineError::read_only_violation("update"));
        }
        Ok(TabularResult::empty())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Driver counting dials; outcomes can be scripted per attempt.
pub struct StubDriver {
    pub backend: BackendKind,
    pub delay: Duration,
    pub connects: AtomicUsize,
    pub targets: Mutex<Vec<(String, u16, Option<String>)>>,
    pub failures: Mutex<VecDeque<EngineError>>,
    pub handles: Mutex<Vec<Arc<StubEngine>>>,
}

impl StubDriver {
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            delay: Duration::from_millis(0),
            connects: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_next(&self, err: EngineError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn last_handle(&self) -> Option<Arc<StubEngine>> {
        self.handles.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Driver for StubDriver {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn driver_name(&self) -> &'static str {
        "Stub"
    }

    async fn connect(&self, target: &DialTarget) -> EngineResult<ClientHandle> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push((
            target.host.clone(),
            target.port,
            target.password.as_ref().map(|p| p.expose().to_string()),
        ));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let handle = Arc::new(StubEngine::new(self.backend));
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

/// Tunnel provider handing out sequential local ports.
#[derive(Default)]
pub struct StubTunnels {
    pub opened: Mutex<Vec<(ConnectionId, String, u16)>>,
    pub closed: Mutex<Vec<ConnectionId>>,
}

impl StubTunnels {
    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelProvider for StubTunnels {
    async fn open_tunnel(&self, request: &TunnelRequest) -> EngineResult<LocalEndpoint> {
        let mut opened = self.opened.lock().unwrap();
        opened.push((
            request.connection_id.clone(),
            request.remote_host.clone(),
            request.remote_port,
        ));
        Ok(LocalEndpoint {
            host: "127.0.0.1".into(),
            port: 40000 + opened.len() as u16,
        })
    }

    async fn close_tunnel(&self, connection_id: &ConnectionId) {
        self.closed.lock().unwrap().push(connection_id.clone());
    }
}
