use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    addrclass::ClassIdAllocator,
    config,
    engine::{InterfaceSnapshot, PolicyEngine},
    error::ConfigError,
    leasedb::LeaseDb,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "command")]
pub enum MgmtRequest {
    #[serde(rename = "reload")]
    Reload,
    #[serde(rename = "status")]
    Status,
}

#[derive(Debug, Default, Serialize)]
pub struct MgmtResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<InterfaceSnapshot>>,
}

/// Rebuilds the class table from disk and swaps it into the running engine.
/// Shared by the management listener and the SIGHUP handler.
pub struct Reloader {
    engine: Arc<PolicyEngine>,
    leases: Arc<LeaseDb>,
    ids: Mutex<ClassIdAllocator>,
    config_dir: PathBuf,
}

impl Reloader {
    /// `ids` must be the allocator the running table was built with.
    pub fn new(
        engine: Arc<PolicyEngine>,
        leases: Arc<LeaseDb>,
        ids: ClassIdAllocator,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            leases,
            ids: Mutex::new(ids),
            config_dir,
        }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    /// On failure the running table stays in place.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let table = {
            let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
            config::load_table(&self.config_dir, &mut ids)?
        };
        let count = table.class_count();
        self.leases.swap_table(&self.engine, table);
        info!(count, config_dir = %self.config_dir.display(), "reloaded address classes");
        Ok(count)
    }

    pub fn handle(&self, request: MgmtRequest) -> MgmtResponse {
        match request {
            MgmtRequest::Reload => match self.reload() {
                Ok(count) => MgmtResponse {
                    success: true,
                    message: Some(format!("Reloaded {count} address classes")),
                    class_count: Some(count),
                    ..Default::default()
                },
                Err(e) => {
                    error!(%e, "reload failed, keeping current address classes");
                    MgmtResponse {
                        error: Some(e.to_string()),
                        ..Default::default()
                    }
                }
            },
            MgmtRequest::Status => {
                let interfaces = self.engine.snapshot();
                MgmtResponse {
                    success: true,
                    message: Some("Status OK".into()),
                    class_count: Some(interfaces.iter().map(|i| i.classes.len()).sum()),
                    lease_count: Some(self.leases.len()),
                    interfaces: Some(interfaces),
                    ..Default::default()
                }
            }
        }
    }
}

/// Main management listener loop
pub fn listener(listener: TcpListener, reloader: Arc<Reloader>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer = stream.peer_addr().ok();
                handle_client(stream, &reloader);
                if let Some(addr) = peer {
                    info!(%addr, "handled management request");
                }
            }
            Err(e) => {
                warn!(%e, "failed to accept management connection");
            }
        }
    }
}

fn handle_client(stream: TcpStream, reloader: &Reloader) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.set_write_timeout(Some(Duration::from_secs(5))).ok();

    let mut reader = BufReader::new(&stream);
    let mut line = String::new();

    match reader.read_line(&mut line) {
        Ok(0) => return, // EOF
        Ok(_) => {}
        Err(e) => {
            warn!(%e, "failed to read from management client");
            return;
        }
    }

    let response = match serde_json::from_str::<MgmtRequest>(&line) {
        Ok(request) => reloader.handle(request),
        Err(e) => MgmtResponse {
            error: Some(format!("Invalid request: {e}")),
            ..Default::default()
        },
    };

    let mut writer = stream;
    if let Err(e) = serde_json::to_writer(&mut writer, &response) {
        warn!(%e, "failed to write response");
    }
    let _ = writer.write_all(b"\n");
}
