//! Docker Engine API client (Swarm services) over the Unix socket.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use super::{
    ExecOutput, Orchestrator, OrchestratorError, ServiceInfo, ServiceSpec, TaskInfo,
};

/// Docker Engine client for Swarm service management.
pub struct DockerOrchestrator {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl DockerOrchestrator {
    /// Create a new client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes), OrchestratorError> {
        let uri = Uri::new(&self.socket_path, path);
        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");

        let request = match body {
            Some(body) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?)),
            None => builder.body(Body::empty()),
        }
        .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|e| OrchestratorError::Transport(e.to_string()))?;

        Ok((status, bytes))
    }

    /// Request that must succeed, decoded as JSON.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, OrchestratorError> {
        let (status, bytes) = self.request(method, path, body).await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        if bytes.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn inspect_raw(&self, name: &str) -> Result<Option<Value>, OrchestratorError> {
        let path = format!("/services/{}", encode(name));
        let (status, bytes) = self.request(Method::GET, &path, None).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(serde_json::from_slice(&bytes)?)),
            s => Err(api_error(s, &bytes)),
        }
    }

    async fn node_addr(&self, node_id: &str) -> Option<String> {
        if node_id.is_empty() {
            return None;
        }
        let path = format!("/nodes/{}", encode(node_id));
        match self.call::<Value>(Method::GET, &path, None).await {
            Ok(node) => node
                .pointer("/Status/Addr")
                .and_then(Value::as_str)
                .filter(|addr| !addr.is_empty() && *addr != "0.0.0.0")
                .map(str::to_string),
            Err(e) => {
                warn!(node_id, error = %e, "Failed to inspect node");
                None
            }
        }
    }

    async fn find_container(&self, name: &str) -> Result<String, OrchestratorError> {
        #[derive(Deserialize)]
        struct Container {
            #[serde(rename = "Id")]
            id: String,
        }

        let filters = json!({ "name": [name], "status": ["running"] }).to_string();
        let path = format!("/containers/json?filters={}", encode(&filters));
        let containers: Vec<Container> = self.call(Method::GET, &path, None).await?;

        containers
            .into_iter()
            .next()
            .map(|c| c.id)
            .ok_or_else(|| OrchestratorError::NoContainer(name.to_string()))
    }
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError> {
        let body = service_body(spec);
        let (status, bytes) = self
            .request(Method::POST, "/services/create", Some(body))
            .await?;

        match status {
            StatusCode::CONFLICT => return Err(OrchestratorError::Conflict(spec.name.clone())),
            s if !s.is_success() => return Err(api_error(s, &bytes)),
            _ => {}
        }

        // Re-read so the caller sees the published ports the engine settled on.
        match self.inspect_service(&spec.name).await? {
            Some(info) => Ok(info),
            None => Err(OrchestratorError::NotFound(spec.name.clone())),
        }
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceInfo>, OrchestratorError> {
        Ok(self.inspect_raw(name).await?.map(|raw| parse_service(&raw)))
    }

    async fn list_tasks(&self, service: &str) -> Result<Vec<TaskInfo>, OrchestratorError> {
        let filters = json!({ "service": [service], "desired-state": ["running"] }).to_string();
        let path = format!("/tasks?filters={}", encode(&filters));
        let (status, bytes) = self.request(Method::GET, &path, None).await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        let raw: Vec<Value> = serde_json::from_slice(&bytes)?;
        let mut tasks = Vec::with_capacity(raw.len());
        for task in &raw {
            let node_id = task.get("NodeID").and_then(Value::as_str).unwrap_or_default();
            let node_addr = self.node_addr(node_id).await;
            tasks.push(parse_task(service, task, node_addr));
        }
        Ok(tasks)
    }

    async fn update_service(&self, spec: &ServiceSpec) -> Result<ServiceInfo, OrchestratorError> {
        let raw = self
            .inspect_raw(&spec.name)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(spec.name.clone()))?;
        let version = raw
            .pointer("/Version/Index")
            .and_then(Value::as_u64)
            .ok_or_else(|| OrchestratorError::Decode("service has no Version.Index".into()))?;

        let path = format!("/services/{}/update?version={version}", encode(&spec.name));
        let (status, bytes) = self
            .request(Method::POST, &path, Some(service_body(spec)))
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        debug!(service = %spec.name, image = %spec.image, "Updated service spec");

        match self.inspect_service(&spec.name).await? {
            Some(info) => Ok(info),
            None => Err(OrchestratorError::NotFound(spec.name.clone())),
        }
    }

    async fn update_replicas(&self, service: &str, replicas: u32) -> Result<(), OrchestratorError> {
        let raw = self
            .inspect_raw(service)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(service.to_string()))?;

        let version = raw
            .pointer("/Version/Index")
            .and_then(Value::as_u64)
            .ok_or_else(|| OrchestratorError::Decode("service has no Version.Index".into()))?;
        let mut spec = raw
            .get("Spec")
            .cloned()
            .ok_or_else(|| OrchestratorError::Decode("service has no Spec".into()))?;
        spec["Mode"] = json!({ "Replicated": { "Replicas": replicas } });

        let path = format!("/services/{}/update?version={version}", encode(service));
        let (status, bytes) = self.request(Method::POST, &path, Some(spec)).await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        debug!(service, replicas, "Updated service replicas");
        Ok(())
    }

    async fn remove_service(&self, service: &str) -> Result<bool, OrchestratorError> {
        let path = format!("/services/{}", encode(service));
        let (status, bytes) = self.request(Method::DELETE, &path, None).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(api_error(s, &bytes)),
        }
    }

    async fn list_services(&self, label: &str) -> Result<Vec<ServiceInfo>, OrchestratorError> {
        let filters = json!({ "label": [label] }).to_string();
        let path = format!("/services?filters={}", encode(&filters));
        let raw: Vec<Value> = self.call(Method::GET, &path, None).await?;
        Ok(raw.iter().map(parse_service).collect())
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput, OrchestratorError> {
        #[derive(Deserialize)]
        struct Created {
            #[serde(rename = "Id")]
            id: String,
        }

        let container_id = self.find_container(container).await?;

        let created: Created = self
            .call(
                Method::POST,
                &format!("/containers/{container_id}/exec"),
                Some(json!({
                    "AttachStdout": true,
                    "AttachStderr": true,
                    "Cmd": cmd,
                })),
            )
            .await?;

        let (status, bytes) = self
            .request(
                Method::POST,
                &format!("/exec/{}/start", created.id),
                Some(json!({ "Detach": false, "Tty": false })),
            )
            .await?;
        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }
        let output = demux_stream(&bytes);

        let inspect: Value = self
            .call(Method::GET, &format!("/exec/{}/json", created.id), None)
            .await?;
        let exit_code = inspect
            .get("ExitCode")
            .and_then(Value::as_i64)
            .unwrap_or(-1);

        debug!(container, ?cmd, exit_code, "Exec finished");
        Ok(ExecOutput { exit_code, output })
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> OrchestratorError {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());

    error!(status = %status, message = %message, "Docker API error");
    OrchestratorError::Api {
        status: status.as_u16(),
        message,
    }
}

fn service_body(spec: &ServiceSpec) -> Value {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let mounts: Vec<Value> = spec
        .mounts
        .iter()
        .map(|m| {
            json!({
                "Type": "bind",
                "Source": m.source.to_string_lossy(),
                "Target": m.target,
            })
        })
        .collect();

    json!({
        "Name": spec.name,
        "Labels": spec.labels,
        "TaskTemplate": {
            "ContainerSpec": {
                "Image": spec.image,
                "Env": env,
                "Mounts": mounts,
                "Labels": spec.labels,
            },
            "RestartPolicy": { "Condition": "any" },
            // Host-mode publishing binds the same port on every task, so at
            // most one task per node can run.
            "Placement": { "MaxReplicas": 1 },
        },
        "Mode": { "Replicated": { "Replicas": spec.replicas } },
        "EndpointSpec": {
            "Ports": [{
                "Protocol": "tcp",
                "TargetPort": spec.target_port,
                "PublishedPort": spec.published_port,
                "PublishMode": "host",
            }],
        },
    })
}

fn parse_service(raw: &Value) -> ServiceInfo {
    let labels: BTreeMap<String, String> = raw
        .pointer("/Spec/Labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    // Endpoint.Ports reflects what the engine actually assigned; fall back to
    // the requested spec ports.
    let published_ports = ["/Endpoint/Ports", "/Spec/EndpointSpec/Ports"]
        .iter()
        .filter_map(|pointer| raw.pointer(pointer).and_then(Value::as_array))
        .find(|ports| !ports.is_empty())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p.get("PublishedPort").and_then(Value::as_u64))
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default();

    ServiceInfo {
        id: str_at(raw, "/ID"),
        name: str_at(raw, "/Spec/Name"),
        replicas: raw
            .pointer("/Spec/Mode/Replicated/Replicas")
            .and_then(Value::as_u64)
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(0),
        labels,
        published_ports,
        version: raw
            .pointer("/Version/Index")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    }
}

fn parse_task(service: &str, raw: &Value, node_addr: Option<String>) -> TaskInfo {
    TaskInfo {
        id: str_at(raw, "/ID"),
        service: service.to_string(),
        state: str_at(raw, "/Status/State"),
        node_addr,
        published_port: raw
            .pointer("/Status/PortStatus/Ports")
            .and_then(Value::as_array)
            .and_then(|ports| ports.first())
            .and_then(|p| p.get("PublishedPort"))
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok()),
    }
}

fn str_at(raw: &Value, pointer: &str) -> String {
    raw.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Split Docker's multiplexed attach stream (8-byte frame headers) into plain
/// text. Input without valid headers is returned as-is.
fn demux_stream(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;

    while rest.len() >= 8 {
        let stream = rest[0];
        if stream > 2 || rest[1..4] != [0, 0, 0] {
            return String::from_utf8_lossy(bytes).to_string();
        }
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    if !rest.is_empty() && out.is_empty() {
        return String::from_utf8_lossy(bytes).to_string();
    }

    String::from_utf8_lossy(&out).to_string()
}

/// Percent-encode a query or path component.
fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
