//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::leases::LeaseTable;
use super::proto::admission_service_server::AdmissionServiceServer;
use super::service::AdmissionServiceImpl;
use crate::error::{Result, TollgateError};
use crate::ratelimit::AdmissionGate;

/// gRPC server for the admission service.
pub struct GrpcServer {
    /// Address to bind to
    addr: SocketAddr,
    gate: Arc<AdmissionGate>,
    leases: Arc<LeaseTable>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, gate: Arc<AdmissionGate>, leases: Arc<LeaseTable>) -> Self {
        Self { addr, gate, leases }
    }

    fn service(&self) -> AdmissionServiceServer<AdmissionServiceImpl> {
        AdmissionServiceServer::new(AdmissionServiceImpl::new(
            self.gate.clone(),
            self.leases.clone(),
        ))
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(addr = %self.addr, "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(self.service())
            .serve_with_shutdown(self.addr, signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }

    /// Serve on an already bound listener, ignoring the configured address.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(addr = ?listener.local_addr().ok(), "Starting gRPC server for AdmissionService");

        Server::builder()
            .add_service(self.service())
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                TollgateError::Grpc(e)
            })
    }
}
