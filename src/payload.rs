//! Upload envelope and its compressed encoding

use crate::errors::Result;
use crate::telemetry::{Attributes, LogRecord, MetadataKind, MetadataRecord};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

/// One upload: the signals plus the resource and metadata they were recorded under
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PayloadEnvelope<T> {
    pub data: T,
    pub resource: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl<T: Serialize> PayloadEnvelope<T> {
    /// Build an envelope from metadata records, split by kind
    pub fn new(data: T, records: &[MetadataRecord]) -> Self {
        let mut resource = BTreeMap::new();
        let mut metadata = BTreeMap::new();

        for record in records {
            match record.kind {
                MetadataKind::Resource | MetadataKind::RequiredResource => {
                    resource.insert(record.key.clone(), record.value.clone());
                }
                MetadataKind::CustomProperty | MetadataKind::PersonaTag => {
                    metadata.insert(record.key.clone(), record.value.clone());
                }
            }
        }

        Self {
            data,
            resource,
            metadata,
        }
    }

    /// JSON encode and gzip compress
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        gzip(&json)
    }
}

/// A log as it is sent over the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogPayload {
    pub log_id: String,
    pub body: String,
    pub severity: String,
    pub severity_number: u8,
    #[serde(rename = "type")]
    pub log_type: String,
    pub time_unix_nano: String,
    pub attributes: Attributes,
}

impl From<&LogRecord> for LogPayload {
    fn from(log: &LogRecord) -> Self {
        let nanos = log
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| log.timestamp.timestamp_micros().saturating_mul(1000));

        Self {
            log_id: log.id.clone(),
            body: log.body.clone(),
            severity: log.severity.to_string(),
            severity_number: log.severity.number(),
            log_type: log.log_type.to_string(),
            time_unix_nano: nanos.to_string(),
            attributes: log.attributes.clone(),
        }
    }
}

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
