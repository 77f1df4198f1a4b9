//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;

use chanfetch_transport::{
    EmulatedRequest, EmulatedResponse, MemoryChannel, Method, Result, TransportClient, TransportConfig,
    TransportServer,
};
use serde_json::{json, Value};

/// One in-process channel: servers attach to one end, clients to the other.
pub struct TestLink {
    pub server_end: Arc<MemoryChannel>,
    pub client_end: Arc<MemoryChannel>,
}

impl TestLink {
    pub fn new() -> Self {
        let (server_end, client_end) = MemoryChannel::pair();
        Self {
            server_end: Arc::new(server_end),
            client_end: Arc::new(client_end),
        }
    }

    /// A server for `instance_id` that is not listening yet.
    pub fn server(&self, instance_id: &str) -> TransportServer {
        self.server_with(TransportConfig::new().with_instance_id(instance_id))
    }

    pub fn server_with(&self, config: TransportConfig) -> TransportServer {
        TransportServer::new(self.server_end.clone(), config).unwrap()
    }

    pub fn client(&self, instance_id: &str) -> TransportClient {
        self.client_with(TransportConfig::new().with_instance_id(instance_id))
    }

    pub fn client_with(&self, config: TransportConfig) -> TransportClient {
        TransportClient::new(self.client_end.clone(), config).unwrap()
    }
}

/// Echoes the request body back as JSON.
pub async fn echo_json(mut req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    let body: Value = req.json().await?;
    res.json(&body);
    Ok(())
}

/// A tiny users API: `POST /api/users` creates, anything else is 404.
pub async fn users_api(mut req: EmulatedRequest, res: EmulatedResponse) -> Result<()> {
    let create = req.method() == Method::Post && req.path() == "/api/users";
    if create {
        let input: Value = req.json().await?;
        res.set_status(201);
        res.json(&json!({ "id": 1, "name": input["name"] }));
    } else {
        res.write_head(404, None);
        res.end_with("not found");
    }
    Ok(())
}
