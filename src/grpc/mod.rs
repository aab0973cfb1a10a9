//! gRPC surface of the admission gate.

mod leases;
mod server;
mod service;

pub use leases::LeaseTable;
pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("tollgate.admission.v1");

    /// Encoded descriptors for the admission API.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("tollgate_admission_descriptor");
}

// Re-export commonly used types
pub use proto::{
    admission_service_client::AdmissionServiceClient,
    admission_service_server::AdmissionServiceServer, CheckRequest, CheckResponse,
};
