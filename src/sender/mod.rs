pub mod client;
pub mod serialization;
pub mod transmission;

pub use client::{ClientConfig, ClientError, ConnectionStats, HttpClient};
pub use serialization::{CodecError, ENCODING_GZIP_BASE64, Payload, PayloadCodec};
pub use transmission::{
    HttpTransport, Outcome, Transport, UploadRequest, classify_client_error, classify_status,
};

#[cfg(test)]
pub use transmission::MockTransport;
